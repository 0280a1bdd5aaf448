// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

use crate::digest::Digest;

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Bucket does not exist")]
    BucketDoesNotExist,
    #[error("Tree is incomplete")]
    Incomplete,
    #[error("Seek to a negative offset")]
    NegativeOffset,
    #[error("Leaf index is out of range")]
    LeafOutOfRange,
    #[error("No branch found for digest `{0}`")]
    BranchNotFound(Digest),
    #[error("Storage error: `{0}`")]
    Storage(#[from] lmdb_zero::Error),
    #[error("I/O error: `{0}`")]
    Io(#[from] std::io::Error),
}
