#![allow(missing_docs)]

use tempfile::tempdir;
use vellum::buffer::ContainerOptions;
use vellum::wal::{LogOptions, SyncMode};
use vellum::{BlinkTree, Engine, EngineOptions, SearchMode};

fn scan_engine_options() -> EngineOptions {
    EngineOptions {
        container: ContainerOptions {
            block_size: 512,
            initial_blocks: 256,
            extend_blocks: 256,
            buffer_frames: 128,
        },
        log: LogOptions {
            segment_bytes: 32 * 1024 * 1024,
            sync_mode: SyncMode::Off,
        },
    }
}

#[test]
fn ten_thousand_inserts_scan_in_order_across_splits() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(dir.path(), scan_engine_options()).unwrap();
    engine.create_container(1).unwrap();

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
    let root = tree.root();
    tx.commit().unwrap();

    // One key at a time, batched into transactions of a thousand.
    for batch in 0..10u32 {
        let tx = engine.begin().unwrap();
        let tree = BlinkTree::open(engine.txs(), root).unwrap();
        for i in 0..1000u32 {
            let key = (batch * 1000 + i + 1).to_be_bytes();
            tree.insert(&tx, &key, &key).unwrap();
        }
        tx.commit().unwrap();
    }

    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    let mut cursor = tree.open_cursor(SearchMode::First, None, None).unwrap();
    let mut expected = 1u32;
    while let Some((key, value)) = cursor.next().unwrap() {
        let got = u32::from_be_bytes(key.as_slice().try_into().unwrap());
        assert_eq!(got, expected, "scan out of order");
        assert_eq!(value, key, "value mismatch at {got}");
        expected += 1;
    }
    assert_eq!(expected, 10_001, "scan must yield exactly 1..10000");

    let stats = tree.stats().unwrap();
    assert!(stats.height >= 2, "tree height {} too small", stats.height);
    assert_eq!(stats.entries, 10_000);
    assert!(stats.leaf_pages > 1);

    let mut listing = Vec::new();
    tree.dump(&mut listing).unwrap();
    let text = String::from_utf8(listing).unwrap();
    assert!(text.contains("level=0"), "dump must list leaf level");

    engine.shutdown(false).unwrap();
}

#[test]
fn traverse_visits_every_level_once() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(dir.path(), scan_engine_options()).unwrap();
    engine.create_container(1).unwrap();

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
    for i in 0..800u32 {
        tree.insert(&tx, &i.to_be_bytes(), b"payload").unwrap();
    }
    tx.commit().unwrap();

    let mut leaf_entries = 0usize;
    let mut max_level = 0u8;
    tree.traverse(|info| {
        if info.is_leaf {
            leaf_entries += info.entries;
            assert!(info.high_key.is_some() || info.right_sibling.is_none());
        }
        max_level = max_level.max(info.level);
        Ok(())
    })
    .unwrap();
    assert_eq!(leaf_entries, 800);
    assert!(max_level >= 1);

    engine.shutdown(false).unwrap();
}
