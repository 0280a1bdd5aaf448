// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

//! # Merkle Forest
//!
//! Stores opaque byte resources as encrypted, content-addressed Merkle trees
//! on disk, protecting both the data and the metadata at rest while keeping
//! it easy to fulfil requests for partial resources with validation.
//!
//! A resource is split into [BLOCK_SIZE] blocks. Each block is hashed and
//! written to its own encrypted leaf file; interior branches and the
//! per-tree descriptor live in an embedded database beside the leaves, all
//! sealed under one symmetric key:
//!
//! ```plaintext
//! <dir>/merkle.db            -- embedded database (branches, descriptors)
//! <dir>/<leaf key as hex>    -- one encrypted file per leaf
//! ```
//!
//! The tree over a run of leaves splits the run at its midpoint, so the
//! shape is a pure function of the leaf count and every leaf index maps to a
//! fixed root-to-leaf path:
//!
//! ```plaintext
//!          root
//!         /    \
//!        /\     \
//!       /  \    /\
//!      0    1  2  3   4            <- 5 leaves: left [0,2), right [2,5)
//! ```
//!
//! Nothing stored on disk reveals content: database keys are derived from
//! digests by sealing them under a reserved zero nonce (stable, so the
//! database can still be point-queried), while every stored value is sealed
//! under a fresh random nonce. A key-check record written on first open
//! makes a wrong-key open fail up front instead of yielding garbage.
//!
//! Reading is provided by [Forest::get_tree] and the [Tree] value it
//! returns, which supports whole-resource reads, `std::io` positional
//! reads and seeks, and leaf extraction with a [ValidationChain]: the
//! sibling digests that let a peer holding only the root digest verify a
//! single leaf. Replicating a resource from an untrusted source works the
//! other way around: [Forest::new_sapling] starts an incomplete tree that
//! absorbs validated leaves in any order via [Tree::add_leaf] until the
//! last one lands and the tree becomes readable.

mod branch;
mod build;
mod cipher;
mod digest;
mod error;
mod forest;
mod lmdb;
mod read;
mod serial;
mod tree;

pub use cipher::{SharedKey, KEY_LENGTH, NONCE_LENGTH, OVERHEAD, TAG_LENGTH};
pub use digest::{Digest, DigestSizeError, DIGEST_LENGTH};
pub use error::ForestError;
pub use forest::{Forest, StoreConfig};
pub use read::{validate_leaf, Uncle, ValidationChain};
pub use tree::{Tree, BLOCK_SIZE};
