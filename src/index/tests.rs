use super::cursor::SearchMode;
use super::tree::BlinkTree;
use crate::buffer::ContainerOptions;
use crate::engine::{Engine, EngineOptions};
use crate::types::{IndexError, StoreError};
use crate::wal::{LogOptions, SyncMode};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

fn small_engine(dir: &Path) -> Engine {
    let opts = EngineOptions {
        container: ContainerOptions {
            block_size: 512,
            initial_blocks: 64,
            extend_blocks: 64,
            buffer_frames: 64,
        },
        log: LogOptions {
            segment_bytes: 4 * 1024 * 1024,
            sync_mode: SyncMode::Normal,
        },
    };
    let engine = Engine::create(dir, opts).unwrap();
    engine.create_container(1).unwrap();
    engine
}

fn key_of(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

#[test]
fn insert_get_within_one_leaf() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    tree.insert(&tx, b"alpha", b"1").unwrap();
    tree.insert(&tx, b"beta", b"2").unwrap();
    tree.insert(&tx, b"gamma", b"3").unwrap();
    assert_eq!(tree.get(b"beta").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.get(b"delta").unwrap(), None);

    tree.delete(&tx, b"beta", b"2").unwrap();
    assert_eq!(tree.get(b"beta").unwrap(), None);
    tx.commit().unwrap();
}

#[test]
fn search_returns_last_write() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    tree.insert(&tx, b"k", b"v1").unwrap();
    tree.delete(&tx, b"k", b"v1").unwrap();
    tree.insert(&tx, b"k", b"v2").unwrap();
    assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));
    tx.commit().unwrap();
}

#[test]
fn splits_preserve_full_sorted_scan() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut keys: Vec<u32> = (0..600).collect();
    for idx in (1..keys.len()).rev() {
        let other = rng.gen_range(0..=idx);
        keys.swap(idx, other);
    }
    for &k in &keys {
        tree.insert(&tx, &key_of(k), &k.to_le_bytes()).unwrap();
    }

    let mut cursor = tree.open_cursor(SearchMode::First, None, None).unwrap();
    let mut seen = Vec::new();
    while let Some((key, value)) = cursor.next().unwrap() {
        assert_eq!(u32::from_be_bytes(key.as_slice().try_into().unwrap()), u32::from_le_bytes(value.as_slice().try_into().unwrap()));
        seen.push(u32::from_be_bytes(key.as_slice().try_into().unwrap()));
    }
    let expected: Vec<u32> = (0..600).collect();
    assert_eq!(seen, expected);

    let stats = tree.stats().unwrap();
    assert!(stats.height >= 2, "600 keys in 512-byte pages must split");
    assert_eq!(stats.entries, 600);
    tx.commit().unwrap();
}

#[test]
fn unique_index_rejects_duplicate_key() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    tree.insert(&tx, b"k", b"v1").unwrap();
    let err = tree.insert(&tx, b"k", b"v2").unwrap_err();
    assert!(matches!(
        err,
        StoreError::Index(IndexError::DuplicateKey)
    ));
    tx.commit().unwrap();
}

#[test]
fn non_unique_index_orders_duplicates_by_value() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, false).unwrap();

    tree.insert(&tx, b"dup", b"c").unwrap();
    tree.insert(&tx, b"dup", b"a").unwrap();
    tree.insert(&tx, b"dup", b"b").unwrap();
    tree.insert(&tx, b"z", b"tail").unwrap();

    let mut cursor = tree
        .open_cursor(SearchMode::GreaterOrEqual, Some(b"dup"), None)
        .unwrap();
    let mut values = Vec::new();
    while let Some((key, value)) = cursor.next().unwrap() {
        if key != b"dup" {
            break;
        }
        values.push(value);
    }
    assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    tree.delete(&tx, b"dup", b"b").unwrap();
    assert_eq!(tree.get(b"dup").unwrap(), Some(b"a".to_vec()));
    let err = tree.delete(&tx, b"dup", b"b").unwrap_err();
    assert!(matches!(
        err,
        StoreError::Index(IndexError::EntryNotFound)
    ));
    tx.commit().unwrap();
}

#[test]
fn duplicate_run_survives_splits() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, false).unwrap();

    // One key, enough distinct values to overflow several leaves.
    for i in 0..300u32 {
        tree.insert(&tx, b"same", &key_of(i)).unwrap();
    }
    let mut cursor = tree
        .open_cursor(SearchMode::GreaterOrEqual, Some(b"same"), None)
        .unwrap();
    let mut count = 0u32;
    while let Some((key, value)) = cursor.next().unwrap() {
        assert_eq!(key, b"same");
        assert_eq!(u32::from_be_bytes(value.as_slice().try_into().unwrap()), count);
        count += 1;
    }
    assert_eq!(count, 300);
    tx.commit().unwrap();
}

#[test]
fn oversized_values_roundtrip_through_overflow_chains() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    let big: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    tree.insert(&tx, b"big", &big).unwrap();
    tree.insert(&tx, b"small", b"x").unwrap();
    assert_eq!(tree.get(b"big").unwrap(), Some(big.clone()));

    tree.delete(&tx, b"big", &big).unwrap();
    assert_eq!(tree.get(b"big").unwrap(), None);
    tx.commit().unwrap();
}

#[test]
fn cursor_modes_position_correctly() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    for k in [10u32, 20, 30, 40] {
        tree.insert(&tx, &key_of(k), b"v").unwrap();
    }

    let mut last = tree.open_cursor(SearchMode::Last, None, None).unwrap();
    let (key, _) = last.next().unwrap().unwrap();
    assert_eq!(key, key_of(40));
    assert!(last.next().unwrap().is_none());

    let mut geq = tree
        .open_cursor(SearchMode::GreaterOrEqual, Some(&key_of(25)), None)
        .unwrap();
    let (key, _) = geq.next().unwrap().unwrap();
    assert_eq!(key, key_of(30));

    let mut leq = tree
        .open_cursor(SearchMode::LessOrEqual, Some(&key_of(25)), None)
        .unwrap();
    let (key, _) = leq.next().unwrap().unwrap();
    assert_eq!(key, key_of(20));
    // Iteration continues forward from the anchor.
    let (key, _) = leq.next().unwrap().unwrap();
    assert_eq!(key, key_of(30));

    let mut bounded = tree
        .open_cursor(SearchMode::First, None, Some(&key_of(20)))
        .unwrap();
    let mut keys = Vec::new();
    while let Some((key, _)) = bounded.next().unwrap() {
        keys.push(key);
    }
    assert_eq!(keys, vec![key_of(10).to_vec(), key_of(20).to_vec()]);
    tx.commit().unwrap();
}

#[test]
fn rollback_restores_previous_tree_state() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
    for k in 0..50u32 {
        tree.insert(&tx, &key_of(k), b"keep").unwrap();
    }
    tree.delete(&tx, &key_of(7), b"keep").unwrap();
    let root = tree.root();
    tx.commit().unwrap();

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    for k in 100..400u32 {
        tree.insert(&tx, &key_of(k), b"doomed").unwrap();
    }
    tree.delete(&tx, &key_of(3), b"keep").unwrap();
    tx.rollback().unwrap();

    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    for k in 0..50u32 {
        let expected = if k == 7 { None } else { Some(b"keep".to_vec()) };
        assert_eq!(tree.get(&key_of(k)).unwrap(), expected, "key {k}");
    }
    for k in 100..400u32 {
        assert_eq!(tree.get(&key_of(k)).unwrap(), None, "rolled-back key {k}");
    }
}

#[test]
fn randomized_operations_match_reference_model() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());
    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(0xB11);
    let mut reference: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    for _ in 0..2000 {
        let k: u32 = rng.gen_range(0..500);
        if rng.gen_bool(0.6) {
            let value = vec![rng.gen::<u8>(); rng.gen_range(1..12)];
            match tree.insert(&tx, &key_of(k), &value) {
                Ok(()) => {
                    assert!(reference.insert(k, value).is_none());
                }
                Err(StoreError::Index(IndexError::DuplicateKey)) => {
                    assert!(reference.contains_key(&k));
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        } else {
            match reference.remove(&k) {
                Some(value) => tree.delete(&tx, &key_of(k), &value).unwrap(),
                None => {
                    assert!(tree.get(&key_of(k)).unwrap().is_none());
                }
            }
        }
    }

    for k in 0..500u32 {
        assert_eq!(tree.get(&key_of(k)).unwrap(), reference.get(&k).cloned());
    }
    let mut cursor = tree.open_cursor(SearchMode::First, None, None).unwrap();
    let mut scanned = Vec::new();
    while let Some((key, value)) = cursor.next().unwrap() {
        scanned.push((u32::from_be_bytes(key.as_slice().try_into().unwrap()), value));
    }
    let expected: Vec<(u32, Vec<u8>)> =
        reference.iter().map(|(k, v)| (*k, v.clone())).collect();
    assert_eq!(scanned, expected);
    tx.commit().unwrap();
}

#[test]
fn drop_index_reclaims_unit_at_commit() {
    let dir = tempdir().unwrap();
    let engine = small_engine(dir.path());

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
    for k in 0..200u32 {
        tree.insert(&tx, &key_of(k), b"v").unwrap();
    }
    let root = tree.root();
    let unit = tree.unit();
    tx.commit().unwrap();

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    tree.drop_index(&tx);
    tx.commit().unwrap();

    let pool = engine.buffers().pool(1).unwrap();
    assert!(!pool.container().unit_exists(unit));
    assert!(BlinkTree::open(engine.txs(), root).is_err());
}
