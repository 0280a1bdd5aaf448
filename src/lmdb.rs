// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

//! Thin helpers over `lmdb-zero` transactions. Values stored through these
//! are already-sealed ciphertexts, so no serialization happens here.

use lmdb_zero::{
    error::LmdbResultExt,
    put,
    ConstTransaction,
    Database,
    WriteTransaction,
};
use log::*;

use crate::error::ForestError;

pub(crate) const LOG_TARGET: &str = "forest::lmdb";

pub(crate) fn lmdb_get(
    txn: &ConstTransaction<'_>,
    db: &Database<'_>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, ForestError> {
    let access = txn.access();
    match access.get::<[u8], [u8]>(db, key).to_opt() {
        Ok(v) => Ok(v.map(<[u8]>::to_vec)),
        Err(e) => {
            error!(target: LOG_TARGET, "Could not get value from lmdb: {:?}", e);
            Err(e.into())
        },
    }
}

pub(crate) fn lmdb_replace(
    txn: &WriteTransaction<'_>,
    db: &Database<'_>,
    key: &[u8],
    value: &[u8],
) -> Result<(), ForestError> {
    txn.access().put(db, key, value, put::Flags::empty()).map_err(|e| {
        error!(target: LOG_TARGET, "Could not put value into lmdb transaction: {:?}", e);
        e.into()
    })
}

/// First key/value pair of a database in key order.
pub(crate) fn lmdb_first(
    txn: &ConstTransaction<'_>,
    db: &Database<'_>,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, ForestError> {
    let access = txn.access();
    let mut cursor = txn.cursor(db).map_err(|e| {
        error!(target: LOG_TARGET, "Could not get read cursor from lmdb: {:?}", e);
        ForestError::from(e)
    })?;
    match cursor.first::<[u8], [u8]>(&access).to_opt()? {
        Some((k, v)) => Ok(Some((k.to_vec(), v.to_vec()))),
        None => Ok(None),
    }
}

/// Seek to `search_key` and return the pair one step past it. When the seek
/// lands on a different key (the search key is gone), that landing pair is
/// returned as-is.
pub(crate) fn lmdb_next_after(
    txn: &ConstTransaction<'_>,
    db: &Database<'_>,
    search_key: &[u8],
) -> Result<Option<(Vec<u8>, Vec<u8>)>, ForestError> {
    let access = txn.access();
    let mut cursor = txn.cursor(db).map_err(|e| {
        error!(target: LOG_TARGET, "Could not get read cursor from lmdb: {:?}", e);
        ForestError::from(e)
    })?;
    let (key, val) = match cursor.seek_range_k::<[u8], [u8]>(&access, search_key).to_opt()? {
        Some(row) => row,
        None => return Ok(None),
    };
    if key != search_key {
        return Ok(Some((key.to_vec(), val.to_vec())));
    }
    match cursor.next::<[u8], [u8]>(&access).to_opt()? {
        Some((k, v)) => Ok(Some((k.to_vec(), v.to_vec()))),
        None => Ok(None),
    }
}
