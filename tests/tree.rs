// Copyright 2022 The Merkle Forest Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use merkle_forest::{Forest, ForestError, SharedKey, ValidationChain, BLOCK_SIZE};
use rand::{
    rngs::{OsRng, StdRng},
    seq::SliceRandom,
    RngCore,
    SeedableRng,
};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn assert_leaf_file_floor(dir: &Path) {
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("merkle.db") {
            continue;
        }
        assert!(entry.file_type().unwrap().is_file(), "should not have a sub directory");
        let size = entry.metadata().unwrap().len();
        assert!(
            size >= BLOCK_SIZE as u64,
            "leaf file too small; expect at least {} got {}",
            BLOCK_SIZE,
            size,
        );
    }
}

// Code takes different paths depending on the shape of the tree, so run the
// same battery over many sizes to hit single-leaf, partial-block, full-block
// and multi-level shapes.
#[test]
fn build_then_read_over_many_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let mut size = 1000;
    while size < BLOCK_SIZE * 10 {
        let data = random_bytes(size);
        let built = forest.build_tree(&data[..]).unwrap();
        let dig = *built.digest();

        let mut tree = forest.get_tree(&dig).unwrap().expect("tree should be found");
        assert_eq!(tree.len() as usize, size);
        assert_eq!(tree.read_all().unwrap(), data);

        // Seek from start, from the current position, and from the end.
        let mut chunk = [0u8; 10];
        let pos = tree.seek(SeekFrom::Start(10)).unwrap();
        assert_eq!(pos, 10);
        tree.read_exact(&mut chunk).unwrap();
        assert_eq!(chunk, data[10..20]);

        let pos = tree.seek(SeekFrom::Current(10)).unwrap();
        assert_eq!(pos, 30);
        tree.read_exact(&mut chunk).unwrap();
        assert_eq!(chunk, data[30..40]);

        let pos = tree.seek(SeekFrom::End(-10)).unwrap();
        assert_eq!(pos, size as u64 - 10);
        tree.read_exact(&mut chunk).unwrap();
        assert_eq!(chunk, data[size - 10..]);

        // Every leaf comes back with the matching slice of the resource and
        // a chain that validates it.
        for i in 0..tree.leaves() {
            let (chain, leaf) = tree.get_leaf(i).unwrap();
            let start = BLOCK_SIZE * i as usize;
            assert_eq!(leaf, data[start..start + leaf.len()], "leaf {} mismatch", i);
            assert!(tree.validate_leaf(&chain, &leaf, i));
        }

        assert_leaf_file_floor(dir.path());

        // Sequential reads step through the resource and stop at the end.
        tree.seek(SeekFrom::Start(0)).unwrap();
        let mut out = [0u8; 1000];
        let mut pos = 0;
        loop {
            let n = tree.read(&mut out).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(out[..n], data[pos..pos + n], "mismatch at {}..{}", pos, pos + n);
            pos += n;
        }
        assert_eq!(pos, size);

        size += 4000;
    }
}

#[test]
fn single_leaf_tree() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(1000);
    let tree = forest.build_tree(&data[..]).unwrap();
    assert_eq!(tree.leaves(), 1);
    assert_eq!(tree.last_block_len(), 1000);
    assert_eq!(tree.len(), 1000);
    assert_eq!(tree.read_all().unwrap(), data);

    // A single leaf proves itself with an empty chain.
    let (chain, leaf) = tree.get_leaf(0).unwrap();
    assert!(chain.is_empty());
    assert_eq!(leaf, data);
    assert!(tree.validate_leaf(&chain, &leaf, 0));
}

#[test]
fn ranged_read_within_one_block() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(5000);
    let mut tree = forest.build_tree(&data[..]).unwrap();
    tree.seek(SeekFrom::Start(10)).unwrap();
    let mut chunk = [0u8; 10];
    tree.read_exact(&mut chunk).unwrap();
    assert_eq!(chunk, data[10..20]);
}

#[test]
fn half_block_tail() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(5 * BLOCK_SIZE / 2);
    let tree = forest.build_tree(&data[..]).unwrap();
    assert_eq!(tree.leaves(), 3);
    assert_eq!(tree.last_block_len() as usize, BLOCK_SIZE / 2);
    for i in 0..tree.leaves() {
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        assert!(tree.validate_leaf(&chain, &leaf, i));
    }
}

#[test]
fn perfect_tree_has_uniform_chain_length() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(4 * BLOCK_SIZE);
    let tree = forest.build_tree(&data[..]).unwrap();
    assert_eq!(tree.leaves(), 4);
    for i in 0..4 {
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(tree.validate_leaf(&chain, &leaf, i));
    }
}

#[test]
fn seek_from_end_reads_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(2 * BLOCK_SIZE + 321);
    let mut tree = forest.build_tree(&data[..]).unwrap();
    tree.seek(SeekFrom::End(-10)).unwrap();
    let mut chunk = [0u8; 10];
    tree.read_exact(&mut chunk).unwrap();
    assert_eq!(chunk, data[data.len() - 10..]);
}

#[test]
fn seeking_before_the_start_fails() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(1000);
    let mut tree = forest.build_tree(&data[..]).unwrap();
    assert!(tree.seek(SeekFrom::End(-2000)).is_err());
    assert!(tree.seek(SeekFrom::Current(-1)).is_err());
}

#[test]
fn reading_past_the_end_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(1500);
    let mut tree = forest.build_tree(&data[..]).unwrap();
    tree.seek(SeekFrom::Start(1500)).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(tree.read(&mut buf).unwrap(), 0);
    tree.seek(SeekFrom::Start(5000)).unwrap();
    assert_eq!(tree.read(&mut buf).unwrap(), 0);
}

#[test]
fn tampered_proofs_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(3 * BLOCK_SIZE - 100);
    let tree = forest.build_tree(&data[..]).unwrap();
    let (chain, leaf) = tree.get_leaf(1).unwrap();
    assert!(tree.validate_leaf(&chain, &leaf, 1));

    // A flipped leaf byte.
    let mut bad_leaf = leaf.clone();
    bad_leaf[17] ^= 0x01;
    assert!(!tree.validate_leaf(&chain, &bad_leaf, 1));

    // A flipped bit in an uncle digest.
    let mut bad_chain = chain.clone();
    let mut dig = *bad_chain.uncles[0].dig;
    dig[0] ^= 0x01;
    bad_chain.uncles[0].dig = dig.into();
    assert!(!tree.validate_leaf(&bad_chain, &leaf, 1));

    // A flipped side flag.
    let mut bad_chain = chain.clone();
    bad_chain.uncles[0].left = !bad_chain.uncles[0].left;
    assert!(!tree.validate_leaf(&bad_chain, &leaf, 1));

    // The right chain presented for the wrong index.
    assert!(!tree.validate_leaf(&chain, &leaf, 0));
    assert!(!tree.validate_leaf(&chain, &leaf, 2));
    assert!(!tree.validate_leaf(&chain, &leaf, 7));

    // A truncated chain.
    let mut bad_chain = chain;
    bad_chain.uncles.pop();
    assert!(!tree.validate_leaf(&bad_chain, &leaf, 1));
}

#[test]
fn sapling_reconstruction_in_order() {
    let from_dir = tempfile::tempdir().unwrap();
    let to_dir = tempfile::tempdir().unwrap();
    let from = Forest::open(from_dir.path(), SharedKey::random()).unwrap();
    let to = Forest::open(to_dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(8 * BLOCK_SIZE / 3);
    let tree = from.build_tree(&data[..]).unwrap();

    let mut sapling = to.new_sapling(*tree.digest(), tree.leaves()).unwrap();
    for i in 0..tree.leaves() {
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        sapling.add_leaf(&chain, &leaf, i).unwrap();
        if i < tree.leaves() - 1 {
            assert!(!sapling.complete(), "tree should not be complete yet");
            assert!(matches!(sapling.read_all(), Err(ForestError::Incomplete)));
            assert!(matches!(sapling.get_leaf(0), Err(ForestError::Incomplete)));
            let mut buf = [0u8; 10];
            assert!(sapling.read(&mut buf).is_err());
        }
    }

    assert!(sapling.complete());
    assert_eq!(sapling.last_block_len(), tree.last_block_len());
    assert_eq!(sapling.read_all().unwrap(), data);

    // The reconstructed tree serves proofs of its own.
    let (chain, leaf) = sapling.get_leaf(1).unwrap();
    assert!(sapling.validate_leaf(&chain, &leaf, 1));
}

#[test]
fn sapling_reconstruction_in_any_order() {
    let from_dir = tempfile::tempdir().unwrap();
    let to_dir = tempfile::tempdir().unwrap();
    let from = Forest::open(from_dir.path(), SharedKey::random()).unwrap();
    let to = Forest::open(to_dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(7 * BLOCK_SIZE - 55);
    let tree = from.build_tree(&data[..]).unwrap();

    let mut indices: Vec<u32> = (0..tree.leaves()).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(42));

    let mut sapling = to.new_sapling(*tree.digest(), tree.leaves()).unwrap();
    for &i in &indices {
        assert!(!sapling.complete());
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        sapling.add_leaf(&chain, &leaf, i).unwrap();
    }
    assert!(sapling.complete());
    assert_eq!(sapling.read_all().unwrap(), data);
}

#[test]
fn sapling_survives_reload_between_submissions() {
    let from_dir = tempfile::tempdir().unwrap();
    let to_dir = tempfile::tempdir().unwrap();
    let from = Forest::open(from_dir.path(), SharedKey::random()).unwrap();
    let to = Forest::open(to_dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(3 * BLOCK_SIZE + 9);
    let tree = from.build_tree(&data[..]).unwrap();
    let dig = *tree.digest();

    to.new_sapling(dig, tree.leaves()).unwrap();
    for i in 0..tree.leaves() {
        // Reload from the descriptor every round; progress must persist.
        let mut sapling = to.get_tree(&dig).unwrap().unwrap();
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        sapling.add_leaf(&chain, &leaf, i).unwrap();
    }
    let sapling = to.get_tree(&dig).unwrap().unwrap();
    assert!(sapling.complete());
    assert_eq!(sapling.read_all().unwrap(), data);
}

#[test]
fn sapling_submissions_are_idempotent() {
    let from_dir = tempfile::tempdir().unwrap();
    let to_dir = tempfile::tempdir().unwrap();
    let from = Forest::open(from_dir.path(), SharedKey::random()).unwrap();
    let to = Forest::open(to_dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(2 * BLOCK_SIZE + 500);
    let tree = from.build_tree(&data[..]).unwrap();

    let mut sapling = to.new_sapling(*tree.digest(), tree.leaves()).unwrap();
    for i in 0..tree.leaves() {
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        sapling.add_leaf(&chain, &leaf, i).unwrap();
        sapling.add_leaf(&chain, &leaf, i).unwrap();
    }
    assert!(sapling.complete());
    assert_eq!(sapling.read_all().unwrap(), data);
}

#[test]
fn sapling_drops_invalid_submissions() {
    let from_dir = tempfile::tempdir().unwrap();
    let to_dir = tempfile::tempdir().unwrap();
    let from = Forest::open(from_dir.path(), SharedKey::random()).unwrap();
    let to = Forest::open(to_dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(3 * BLOCK_SIZE - 1);
    let tree = from.build_tree(&data[..]).unwrap();

    let mut sapling = to.new_sapling(*tree.digest(), tree.leaves()).unwrap();
    for i in 1..tree.leaves() {
        let (chain, leaf) = tree.get_leaf(i).unwrap();
        sapling.add_leaf(&chain, &leaf, i).unwrap();
    }

    // A tampered leaf, a chain for the wrong index, and an out-of-range
    // index are all ignored without error.
    let (chain, leaf) = tree.get_leaf(0).unwrap();
    let mut bad_leaf = leaf.clone();
    bad_leaf[0] ^= 0x01;
    sapling.add_leaf(&chain, &bad_leaf, 0).unwrap();
    assert!(!sapling.complete());
    sapling.add_leaf(&chain, &leaf, 1).unwrap();
    assert!(!sapling.complete());
    sapling.add_leaf(&chain, &leaf, tree.leaves() + 5).unwrap();
    assert!(!sapling.complete());

    // The honest submission still lands.
    sapling.add_leaf(&chain, &leaf, 0).unwrap();
    assert!(sapling.complete());
    assert_eq!(sapling.read_all().unwrap(), data);
}

#[test]
fn corrupted_chain_from_the_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let forest = Forest::open(dir.path(), SharedKey::random()).unwrap();

    let data = random_bytes(4 * BLOCK_SIZE + 1);
    let tree = forest.build_tree(&data[..]).unwrap();
    let (chain, leaf) = tree.get_leaf(0).unwrap();

    let mut corrupt: ValidationChain = chain;
    let mut dig = *corrupt.uncles[0].dig;
    dig[5] ^= 0x10;
    corrupt.uncles[0].dig = dig.into();
    assert!(!tree.validate_leaf(&corrupt, &leaf, 0));
}
