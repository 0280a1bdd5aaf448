// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use std::io::Read;

use log::*;

use crate::{
    branch::{Branch, L_LEAF_MASK, R_LEAF_MASK},
    digest::Digest,
    error::ForestError,
    forest::Forest,
    read::{dir_chain, ValidationChain},
    tree::{Tree, BLOCK_SIZE},
};

const LOG_TARGET: &str = "forest::build";

impl Forest {
    /// Stream a resource into the forest, returning its complete tree.
    ///
    /// The source is consumed in `BLOCK_SIZE` blocks (short reads are
    /// coalesced); each block becomes one encrypted leaf file and the leaf
    /// digests are folded into branches bottom-up. An empty source still
    /// produces a single empty leaf.
    pub fn build_tree<R: Read>(&self, mut source: R) -> Result<Tree<'_>, ForestError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut leaf_digests = Vec::new();
        let mut last_block_len = 0u16;
        loop {
            let mut cur = 0;
            while cur < BLOCK_SIZE {
                let n = source.read(&mut buf[cur..])?;
                if n == 0 {
                    break;
                }
                cur += n;
            }
            if cur == 0 && !leaf_digests.is_empty() {
                break;
            }
            // The padding of a short final block is zeroed so the sealed
            // bytes never depend on a previous block's contents.
            buf[cur..].fill(0);
            let dig = self.write_leaf(&buf, cur)?;
            last_block_len = cur as u16;
            leaf_digests.push(dig);
            if cur < BLOCK_SIZE {
                break;
            }
        }
        let (dig, _) = self.recursive_build(&leaf_digests)?;
        debug!(
            target: LOG_TARGET,
            "Built tree `{}` with {} leaves (last block {} B)",
            dig,
            leaf_digests.len(),
            last_block_len,
        );
        let tree = Tree {
            dig,
            leaves: leaf_digests.len() as u32,
            last_block_len,
            complete: true,
            leaves_complete: Vec::new(),
            forest: self,
            pos: 0,
        };
        self.write_tree(&tree)?;
        Ok(tree)
    }

    /// Fold a run of leaf digests into a subtree, persisting every branch.
    /// Returns the subtree's digest and whether it is a bare leaf.
    fn recursive_build(&self, leaves: &[Digest]) -> Result<(Digest, bool), ForestError> {
        if leaves.len() == 1 {
            return Ok((leaves[0], true));
        }
        let mid = leaves.len() / 2;
        let mut pattern = 0;
        let (left, is_leaf) = self.recursive_build(&leaves[..mid])?;
        if is_leaf {
            pattern |= L_LEAF_MASK;
        }
        let (right, is_leaf) = self.recursive_build(&leaves[mid..])?;
        if is_leaf {
            pattern |= R_LEAF_MASK;
        }
        let branch = Branch::new(left, right, pattern);
        self.write_branch(&branch)?;
        Ok((branch.dig, false))
    }
}

impl<'f> Tree<'f> {
    /// Add a validated leaf to a sapling.
    ///
    /// The leaf is checked against the sapling's root digest using the
    /// validation chain; submissions that are out of range, already
    /// absorbed, oversized or fail validation are dropped without side
    /// effects. Storage failures surface as errors.
    pub fn add_leaf(&mut self, chain: &ValidationChain, leaf: &[u8], l_idx: u32) -> Result<(), ForestError> {
        if self.complete || l_idx >= self.leaves {
            return Ok(());
        }
        if self.leaves_complete[l_idx as usize] {
            return Ok(());
        }
        if leaf.len() > BLOCK_SIZE || !self.validate_leaf(chain, leaf, l_idx) {
            trace!(
                target: LOG_TARGET,
                "Dropping invalid submission for leaf {} of `{}`",
                l_idx,
                self.dig,
            );
            return Ok(());
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        block[..leaf.len()].copy_from_slice(leaf);
        if leaf.len() < BLOCK_SIZE {
            // Only the last block of a resource can be short; validation has
            // already pinned this leaf to its index.
            self.last_block_len = leaf.len() as u16;
        }

        let mut dig = self.forest.write_leaf(&block, leaf.len())?;
        self.leaves_complete[l_idx as usize] = true;

        // Walk the chain upward, merging each level into the store. Only the
        // first level evidences a leaf child; an uncle's own structure stays
        // unknown until its side of the tree is walked.
        let dirs = dir_chain(l_idx, 0, self.leaves);
        let mut is_leaf = true;
        for (uncle, dir) in chain.uncles.iter().zip(dirs) {
            let mut pattern = 0;
            dig = if dir {
                if is_leaf {
                    pattern = L_LEAF_MASK;
                }
                self.forest.merge_branch(&dig, &uncle.dig, pattern)?
            } else {
                if is_leaf {
                    pattern = R_LEAF_MASK;
                }
                self.forest.merge_branch(&uncle.dig, &dig, pattern)?
            };
            is_leaf = false;
        }

        if self.leaves_complete.iter().all(|&done| done) {
            self.complete = true;
            self.leaves_complete.clear();
            debug!(target: LOG_TARGET, "Sapling `{}` is complete", self.dig);
        }
        self.forest.write_tree(self)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cipher::SharedKey;

    #[test]
    fn exact_multiple_of_block_size_has_no_trailing_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();
        let data = vec![7u8; BLOCK_SIZE * 4];
        let tree = forest.build_tree(&data[..]).unwrap();
        assert_eq!(tree.leaves(), 4);
        assert_eq!(tree.last_block_len() as usize, BLOCK_SIZE);
        assert_eq!(tree.len() as usize, data.len());
    }

    #[test]
    fn empty_source_builds_a_single_empty_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();
        let tree = forest.build_tree(std::io::empty()).unwrap();
        assert_eq!(tree.leaves(), 1);
        assert_eq!(tree.last_block_len(), 0);
        assert!(tree.complete());
        assert_eq!(tree.read_all().unwrap(), Vec::<u8>::new());
    }
}
