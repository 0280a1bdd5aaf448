// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    convert::TryFrom,
    fmt,
    ops::Deref,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// The length in bytes of a [Digest]. Every content-addressed entity in a
/// forest is identified by a digest of this size.
pub const DIGEST_LENGTH: usize = 32;

#[derive(Debug, Error)]
#[error("Invalid digest size")]
pub struct DigestSizeError;

/// A SHA-256 digest. Digests are the content address of leaves, branches and
/// trees; equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    pub const fn byte_size() -> usize {
        DIGEST_LENGTH
    }

    /// Hash a single byte string.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hash the concatenation of two byte strings. A branch digest is the
    /// pair digest of its children.
    pub fn of_pair(left: &[u8], right: &[u8]) -> Self {
        Self(Sha256::new().chain_update(left).chain_update(right).finalize().into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = DigestSizeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != DIGEST_LENGTH {
            return Err(DigestSizeError);
        }
        let mut buf = [0u8; DIGEST_LENGTH];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl Deref for Digest {
    type Target = [u8; DIGEST_LENGTH];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}
