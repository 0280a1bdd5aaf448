// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use lmdb_zero::{
    db,
    open,
    Database,
    DatabaseOptions,
    EnvBuilder,
    Environment,
    ReadTransaction,
    WriteTransaction,
};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    branch::Branch,
    cipher::{Cipher, SharedKey},
    digest::Digest,
    error::ForestError,
    lmdb::{lmdb_first, lmdb_get, lmdb_next_after, lmdb_replace},
    tree::{Tree, BLOCK_SIZE},
};

const LOG_TARGET: &str = "forest::store";
const BYTES_PER_MB: usize = 1024 * 1024;

const DB_FILENAME: &str = "merkle.db";
const BRANCHES_DB: &str = "b";
const TREES_DB: &str = "t";
// Stored in the trees bucket; a collision with a derived tree key is
// negligible in the hash output space.
const KEY_CHECK_KEY: &[u8] = b"__key__";

pub(crate) type DatabaseRef = Arc<Database<'static>>;

/// Sizing parameters for the embedded database environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    init_size_bytes: usize,
    grow_size_bytes: usize,
    resize_threshold_bytes: usize,
    max_buckets: u32,
}

impl StoreConfig {
    /// Specify the environment size in bytes.
    pub fn new(init_size_bytes: usize, grow_size_bytes: usize, resize_threshold_bytes: usize) -> Self {
        Self {
            init_size_bytes,
            grow_size_bytes,
            resize_threshold_bytes,
            max_buckets: 16,
        }
    }

    /// Specify the environment size in megabytes.
    pub fn new_from_mb(init_size_mb: usize, grow_size_mb: usize, resize_threshold_mb: usize) -> Self {
        Self::new(
            init_size_mb * BYTES_PER_MB,
            grow_size_mb * BYTES_PER_MB,
            resize_threshold_mb * BYTES_PER_MB,
        )
    }

    /// Maximum number of named buckets the environment can hold, including
    /// the two reserved for branches and trees.
    pub fn with_max_buckets(mut self, max_buckets: u32) -> Self {
        self.max_buckets = max_buckets;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new_from_mb(16, 16, 8)
    }
}

/// A Forest is a directory used to store Merkle trees. A forest has a
/// symmetric encryption key that is used to secure the data: leaves live as
/// individual encrypted files in the directory, while branches and tree
/// descriptors live in an embedded database file alongside them. Neither
/// plaintext content nor plaintext digests ever reach disk.
pub struct Forest {
    dir: PathBuf,
    cipher: Cipher,
    env: Arc<Environment>,
    config: StoreConfig,
    branches: DatabaseRef,
    trees: DatabaseRef,
    aux: RwLock<HashMap<String, DatabaseRef>>,
}

impl Forest {
    /// Open or create a forest at `path` with the default configuration.
    ///
    /// On first open a key-check record is sealed into the store; subsequent
    /// opens must present the same key or fail with
    /// [`ForestError::DecryptionFailed`] before anything is written.
    pub fn open<P: AsRef<Path>>(path: P, key: SharedKey) -> Result<Self, ForestError> {
        Self::open_with_config(path, key, StoreConfig::default())
    }

    /// Open or create a forest at `path`.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        key: SharedKey,
        config: StoreConfig,
    ) -> Result<Self, ForestError> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let db_path = dir.join(DB_FILENAME);
        let db_path = db_path
            .to_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "forest path is not valid UTF-8"))?
            .to_string();

        let env = unsafe {
            let mut builder = EnvBuilder::new()?;
            builder.set_mapsize(config.init_size_bytes)?;
            builder.set_maxdbs(config.max_buckets)?;
            let env = builder.open(&db_path, open::NOSUBDIR | open::NOTLS, 0o600)?;
            // SAFETY: no transactions exist on a freshly opened environment.
            Self::resize_if_required(&env, &config)?;
            Arc::new(env)
        };

        let branches = Arc::new(Database::open(
            env.clone(),
            Some(BRANCHES_DB),
            &DatabaseOptions::new(db::CREATE),
        )?);
        let trees = Arc::new(Database::open(
            env.clone(),
            Some(TREES_DB),
            &DatabaseOptions::new(db::CREATE),
        )?);

        let cipher = Cipher::new(&key);
        let txn = WriteTransaction::new(env.clone())?;
        match lmdb_get(&txn, &trees, KEY_CHECK_KEY)? {
            None => {
                let sealed = cipher.seal(KEY_CHECK_KEY)?;
                lmdb_replace(&txn, &trees, KEY_CHECK_KEY, &sealed)?;
                txn.commit()?;
                debug!(target: LOG_TARGET, "({}) Initialised key check record", db_path);
            },
            Some(sealed) => {
                // Aborted by drop; a failed check leaves the store untouched.
                let plain = cipher.open(&sealed)?;
                if plain != KEY_CHECK_KEY {
                    return Err(ForestError::DecryptionFailed);
                }
            },
        }

        debug!(target: LOG_TARGET, "({}) Forest is open", db_path);
        Ok(Self {
            dir,
            cipher,
            env,
            config,
            branches,
            trees,
            aux: RwLock::new(HashMap::new()),
        })
    }

    /// Force a sync of the environment's buffers to disk.
    pub fn flush(&self) -> Result<(), ForestError> {
        trace!(target: LOG_TARGET, "Forcing flush of buffers to disk");
        self.env.sync(true)?;
        Ok(())
    }

    /// Grow the environment when remaining map space drops below the
    /// configured threshold.
    ///
    /// # Safety
    /// May only be called while no write transactions are active in the
    /// current process.
    unsafe fn resize_if_required(env: &Environment, config: &StoreConfig) -> Result<(), ForestError> {
        let info = env.info()?;
        let stat = env.stat()?;
        let used = stat.psize as usize * info.last_pgno;
        if info.mapsize - used <= config.resize_threshold_bytes {
            let new_size = info.mapsize + config.grow_size_bytes;
            env.set_mapsize(new_size)?;
            debug!(
                target: LOG_TARGET,
                "Resized LMDB environment from {} MB to {} MB",
                info.mapsize / BYTES_PER_MB,
                new_size / BYTES_PER_MB,
            );
        }
        Ok(())
    }

    /// The stable, opaque database key for a digest.
    pub(crate) fn db_key(&self, d: &Digest) -> Result<Vec<u8>, ForestError> {
        self.cipher.derive_key(d.as_slice())
    }

    fn leaf_path(&self, d: &Digest) -> Result<PathBuf, ForestError> {
        Ok(self.dir.join(hex::encode(self.db_key(d)?)))
    }

    pub(crate) fn read_branch(&self, d: &Digest) -> Result<Option<Branch>, ForestError> {
        let key = self.db_key(d)?;
        let txn = ReadTransaction::new(self.env.clone())?;
        let sealed = match lmdb_get(&txn, &self.branches, &key)? {
            Some(sealed) => sealed,
            None => return Ok(None),
        };
        drop(txn);
        let branch = self
            .cipher
            .open(&sealed)
            .ok()
            .and_then(|plain| Branch::unmarshal(&plain));
        match branch {
            Some(branch) if branch.dig == *d => Ok(Some(branch)),
            // The record decrypted to the wrong children or not at all.
            // TODO: consider deleting the record; it can never be read back.
            _ => {
                error!(
                    target: LOG_TARGET,
                    "Branch record for `{}` fails digest recomputation; treating as absent", d
                );
                Ok(None)
            },
        }
    }

    pub(crate) fn write_branch(&self, branch: &Branch) -> Result<(), ForestError> {
        let key = self.db_key(&branch.dig)?;
        let sealed = self.cipher.seal(&branch.marshal())?;
        let txn = WriteTransaction::new(self.env.clone())?;
        lmdb_replace(&txn, &self.branches, &key, &sealed)?;
        txn.commit()?;
        Ok(())
    }

    /// Get-or-create for a branch arriving from a validation chain. When the
    /// branch already exists the stored pattern is widened by OR-ing in the
    /// new bits; read and write happen inside one transaction so concurrent
    /// arrivals cannot lose an update.
    pub(crate) fn merge_branch(&self, left: &Digest, right: &Digest, pattern: u8) -> Result<Digest, ForestError> {
        let dig = Digest::of_pair(left.as_slice(), right.as_slice());
        let key = self.db_key(&dig)?;
        let txn = WriteTransaction::new(self.env.clone())?;
        let mut merged = pattern;
        if let Some(sealed) = lmdb_get(&txn, &self.branches, &key)? {
            match self.cipher.open(&sealed).ok().and_then(|p| Branch::unmarshal(&p)) {
                Some(existing) if existing.dig == dig => merged |= existing.pattern,
                _ => warn!(
                    target: LOG_TARGET,
                    "Existing branch record for `{}` is corrupt and will be overwritten", dig
                ),
            }
        }
        let branch = Branch::new(*left, *right, merged);
        let sealed = self.cipher.seal(&branch.marshal())?;
        lmdb_replace(&txn, &self.branches, &key, &sealed)?;
        txn.commit()?;
        Ok(dig)
    }

    /// Write one leaf file. The digest covers only `block[..content_len]`;
    /// the whole (padded) block is sealed and written.
    pub(crate) fn write_leaf(&self, block: &[u8], content_len: usize) -> Result<Digest, ForestError> {
        let dig = Digest::of(&block[..content_len]);
        let sealed = self.cipher.seal(block)?;
        fs::write(self.leaf_path(&dig)?, sealed)?;
        Ok(dig)
    }

    /// Read and decrypt a leaf file. The returned block is still padded; the
    /// logical length of the final leaf comes from the tree descriptor.
    pub(crate) fn read_leaf(&self, d: &Digest) -> Result<Vec<u8>, ForestError> {
        let sealed = fs::read(self.leaf_path(d)?)?;
        self.cipher.open(&sealed)
    }

    pub(crate) fn write_tree(&self, tree: &Tree<'_>) -> Result<(), ForestError> {
        let key = self.db_key(tree.digest())?;
        let sealed = self.cipher.seal(&tree.marshal_descriptor())?;
        let txn = WriteTransaction::new(self.env.clone())?;
        lmdb_replace(&txn, &self.trees, &key, &sealed)?;
        txn.commit()?;
        Ok(())
    }

    /// Return a tree from the forest. This is only a reference to the tree,
    /// not the data in the tree. Unknown roots yield `Ok(None)`.
    pub fn get_tree(&self, d: &Digest) -> Result<Option<Tree<'_>>, ForestError> {
        let key = self.db_key(d)?;
        let txn = ReadTransaction::new(self.env.clone())?;
        let sealed = match lmdb_get(&txn, &self.trees, &key)? {
            Some(sealed) => sealed,
            None => return Ok(None),
        };
        drop(txn);
        let plain = self.cipher.open(&sealed)?;
        match Tree::unmarshal_descriptor(*d, &plain, self) {
            Some(tree) => Ok(Some(tree)),
            None => {
                error!(
                    target: LOG_TARGET,
                    "Tree descriptor for `{}` is malformed; treating as absent", d
                );
                Ok(None)
            },
        }
    }

    /// Start incremental reconstruction of a tree whose root digest and leaf
    /// count are already known. The returned sapling accepts leaves in any
    /// order via [`Tree::add_leaf`].
    pub fn new_sapling(&self, dig: Digest, leaves: u32) -> Result<Tree<'_>, ForestError> {
        let tree = Tree {
            dig,
            leaves,
            last_block_len: BLOCK_SIZE as u16,
            complete: false,
            leaves_complete: vec![false; leaves as usize],
            forest: self,
            pos: 0,
        };
        self.write_tree(&tree)?;
        Ok(tree)
    }

    fn aux_db(&self, bucket: &str, create: bool) -> Result<Option<DatabaseRef>, ForestError> {
        if let Some(database) = self.aux.read().expect("aux bucket map poisoned").get(bucket) {
            return Ok(Some(database.clone()));
        }
        let flags = if create { db::CREATE } else { db::Flags::empty() };
        match Database::open(self.env.clone(), Some(bucket), &DatabaseOptions::new(flags)) {
            Ok(database) => {
                let database = Arc::new(database);
                self.aux
                    .write()
                    .expect("aux bucket map poisoned")
                    .insert(bucket.to_string(), database.clone());
                Ok(Some(database))
            },
            Err(e) => {
                if e == lmdb_zero::Error::Code(lmdb_zero::error::NOTFOUND) {
                    return Ok(None);
                }
                Err(e.into())
            },
        }
    }

    /// Save a single value outside the Merkle tree structure. Provides a
    /// simple way to keep other secured information in the same container as
    /// the trees; the bucket is created on demand.
    pub fn put_value(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), ForestError> {
        let database = self.aux_db(bucket, true)?.ok_or(ForestError::BucketDoesNotExist)?;
        let derived = self.cipher.derive_key(key)?;
        let sealed = self.cipher.seal(value)?;
        let txn = WriteTransaction::new(self.env.clone())?;
        lmdb_replace(&txn, &database, &derived, &sealed)?;
        txn.commit()?;
        Ok(())
    }

    /// Return a single value stored with [`put_value`](Self::put_value).
    /// Reading from a bucket that was never created fails with
    /// [`ForestError::BucketDoesNotExist`]; a missing key yields `Ok(None)`.
    pub fn get_value(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ForestError> {
        let database = self.aux_db(bucket, false)?.ok_or(ForestError::BucketDoesNotExist)?;
        let derived = self.cipher.derive_key(key)?;
        let txn = ReadTransaction::new(self.env.clone())?;
        match lmdb_get(&txn, &database, &derived)? {
            Some(sealed) => self.cipher.open(&sealed).map(Some),
            None => Ok(None),
        }
    }

    /// The first key/value pair in a bucket, in stored-key order (opaque
    /// with respect to the plaintext keys). Returns decrypted plaintext.
    pub fn first(&self, bucket: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>, ForestError> {
        let database = self.aux_db(bucket, false)?.ok_or(ForestError::BucketDoesNotExist)?;
        let txn = ReadTransaction::new(self.env.clone())?;
        match lmdb_first(&txn, &database)? {
            Some((key, value)) => self.decode_pair(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// The key/value pair following `after_key` in stored-key order;
    /// `Ok(None)` once the bucket is exhausted.
    pub fn next(&self, bucket: &str, after_key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, ForestError> {
        let database = self.aux_db(bucket, false)?.ok_or(ForestError::BucketDoesNotExist)?;
        let derived = self.cipher.derive_key(after_key)?;
        let txn = ReadTransaction::new(self.env.clone())?;
        match lmdb_next_after(&txn, &database, &derived)? {
            Some((key, value)) => self.decode_pair(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    fn decode_pair(&self, key: &[u8], value: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ForestError> {
        let key = self.cipher.open_derived_key(key)?;
        let value = self.cipher.open(value)?;
        Ok((key, value))
    }
}
