// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
    Key,
    Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ForestError;

/// Length of the symmetric key in bytes.
pub const KEY_LENGTH: usize = 32;
/// Length of the nonce prefixed to every sealed value.
pub const NONCE_LENGTH: usize = 12;
/// Length of the authentication tag appended by the cipher.
pub const TAG_LENGTH: usize = 16;
/// Total ciphertext overhead of a sealed value over its plaintext.
pub const OVERHEAD: usize = NONCE_LENGTH + TAG_LENGTH;

// Reserved for database-key derivation. Sealing a value under this nonce
// would repeat (nonce, key) pairs across distinct plaintexts, which breaks
// the cipher; only `derive_key` may use it.
const ZERO_NONCE: [u8; NONCE_LENGTH] = [0u8; NONCE_LENGTH];

/// The symmetric key securing a forest. Holders of the key can decrypt every
/// leaf, branch and descriptor in the store; the bytes are wiped on drop and
/// the type deliberately has no `Debug` or serde surface.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_LENGTH]);

impl SharedKey {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl From<[u8; KEY_LENGTH]> for SharedKey {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Self::new(bytes)
    }
}

/// Authenticated encryption for everything a forest persists. Sealed values
/// carry their nonce as a prefix: `nonce(12) ‖ ciphertext ‖ tag(16)`.
pub(crate) struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    pub fn new(key: &SharedKey) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    /// Seal a value under a fresh random nonce, prefixing the nonce to the
    /// returned ciphertext. At-rest bytes never repeat, even for identical
    /// plaintexts written twice.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, ForestError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| ForestError::EncryptionFailed)?;
        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed value, parsing the nonce prefix and verifying the tag.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, ForestError> {
        if sealed.len() < OVERHEAD {
            return Err(ForestError::DecryptionFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ForestError::DecryptionFailed)
    }

    /// Open a ciphertext that lacks its nonce prefix, using a caller-supplied
    /// nonce. Database keys produced by [`derive_key`](Self::derive_key) are
    /// decrypted this way.
    pub fn nonce_open(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LENGTH]) -> Result<Vec<u8>, ForestError> {
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ForestError::DecryptionFailed)
    }

    /// Derive the stable, opaque database key for a plaintext key: seal under
    /// the all-zero nonce and strip the nonce prefix. Deterministic, so the
    /// database can be point-queried by digest without plaintext digests ever
    /// reaching disk.
    pub fn derive_key(&self, plain: &[u8]) -> Result<Vec<u8>, ForestError> {
        self.aead
            .encrypt(Nonce::from_slice(&ZERO_NONCE), plain)
            .map_err(|_| ForestError::EncryptionFailed)
    }

    /// Recover the plaintext key from a database key produced by
    /// [`derive_key`](Self::derive_key).
    pub fn open_derived_key(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ForestError> {
        self.nonce_open(ciphertext, &ZERO_NONCE)
    }
}
