// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use std::convert::TryFrom;

use crate::{
    digest::Digest,
    forest::Forest,
    serial,
};

/// The size of each leaf in bytes. Most disks have a physical sector size of
/// 4096; a block plus its encryption overhead is sized to fit two sectors
/// with margin to spare, so a leaf file never spills into a third sector.
pub const BLOCK_SIZE: usize = 8112;

/// Minimum length of a marshalled tree descriptor:
/// `leaves(4) ‖ last_block_len(2) ‖ complete(1)`.
pub(crate) const DESCRIPTOR_MIN_LENGTH: usize = 7;

/// A stored resource, identified by the root digest of its Merkle tree.
///
/// A complete tree supports whole and ranged reads and leaf extraction with
/// a validation chain. An incomplete tree (a *sapling*) tracks which
/// leaves have arrived during incremental reconstruction and flips to
/// complete in place once the last one lands.
pub struct Tree<'f> {
    pub(crate) dig: Digest,
    pub(crate) leaves: u32,
    pub(crate) last_block_len: u16,
    pub(crate) complete: bool,
    pub(crate) leaves_complete: Vec<bool>,
    pub(crate) forest: &'f Forest,
    pub(crate) pos: i64,
}

impl<'f> Tree<'f> {
    /// The digest identifying the tree. This can be used to request the tree
    /// from a forest.
    pub fn digest(&self) -> &Digest {
        &self.dig
    }

    /// True once the tree has all its leaves.
    pub fn complete(&self) -> bool {
        self.complete
    }

    /// Number of leaves in the tree.
    pub fn leaves(&self) -> u32 {
        self.leaves
    }

    /// Logical length of the final block in bytes.
    pub fn last_block_len(&self) -> u16 {
        self.last_block_len
    }

    /// Total byte length of the resource. Meaningful once the tree is
    /// complete.
    pub fn len(&self) -> u64 {
        u64::from(self.leaves.saturating_sub(1)) * BLOCK_SIZE as u64 + u64::from(self.last_block_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor wire format: `leaves(u32 LE) ‖ last_block_len(u16 LE) ‖
    /// complete(u8)`, followed by the bit-packed per-leaf completeness
    /// vector iff the tree is incomplete.
    pub(crate) fn marshal_descriptor(&self) -> Vec<u8> {
        let mut len = DESCRIPTOR_MIN_LENGTH;
        if !self.complete {
            len += serial::bool_slice_len(self.leaves_complete.len());
        }
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&self.leaves.to_le_bytes());
        buf.extend_from_slice(&self.last_block_len.to_le_bytes());
        buf.push(u8::from(self.complete));
        if !self.complete {
            serial::marshal_bool_slice(&self.leaves_complete, &mut buf);
        }
        buf
    }

    /// Reconstruct a tree from a descriptor record. Returns `None` on a
    /// malformed record.
    pub(crate) fn unmarshal_descriptor(dig: Digest, bytes: &[u8], forest: &'f Forest) -> Option<Self> {
        if bytes.len() < DESCRIPTOR_MIN_LENGTH {
            return None;
        }
        let leaves = u32::from_le_bytes(<[u8; 4]>::try_from(&bytes[..4]).ok()?);
        let last_block_len = u16::from_le_bytes(<[u8; 2]>::try_from(&bytes[4..6]).ok()?);
        let complete = bytes[6] == 1;
        let leaves_complete = if complete {
            Vec::new()
        } else {
            serial::unmarshal_bool_slice(&bytes[DESCRIPTOR_MIN_LENGTH..])?
        };
        Some(Self {
            dig,
            leaves,
            last_block_len,
            complete,
            leaves_complete,
            forest,
            pos: 0,
        })
    }
}
