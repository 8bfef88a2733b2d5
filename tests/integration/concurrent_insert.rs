#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use vellum::buffer::ContainerOptions;
use vellum::wal::{LogOptions, SyncMode};
use vellum::{BlinkTree, Engine, EngineOptions, SearchMode};

fn concurrent_engine_options() -> EngineOptions {
    EngineOptions {
        container: ContainerOptions {
            block_size: 512,
            initial_blocks: 256,
            extend_blocks: 256,
            buffer_frames: 128,
        },
        log: LogOptions {
            segment_bytes: 16 * 1024 * 1024,
            sync_mode: SyncMode::Normal,
        },
    }
}

#[test]
fn disjoint_ranges_from_two_transactions_merge_losslessly() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::create(dir.path(), concurrent_engine_options()).unwrap());
    engine.create_container(1).unwrap();

    let setup = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &setup, 1, true).unwrap();
    let root = tree.root();
    setup.commit().unwrap();

    let mut workers = Vec::new();
    for worker in 0..2u32 {
        let engine = Arc::clone(&engine);
        workers.push(thread::spawn(move || {
            let tx = engine.begin().unwrap();
            let tree = BlinkTree::open(engine.txs(), root).unwrap();
            // Worker 0 inserts evens, worker 1 odds; the ranges interleave
            // across the same leaves and their splits.
            let mut i = worker;
            while i < 2000 {
                tree.insert(&tx, &i.to_be_bytes(), &i.to_le_bytes()).unwrap();
                i += 2;
            }
            tx.commit().unwrap();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    let mut cursor = tree.open_cursor(SearchMode::First, None, None).unwrap();
    let mut expected = 0u32;
    while let Some((key, value)) = cursor.next().unwrap() {
        let got = u32::from_be_bytes(key.as_slice().try_into().unwrap());
        assert_eq!(got, expected, "entry lost or duplicated");
        assert_eq!(u32::from_le_bytes(value.as_slice().try_into().unwrap()), got);
        expected += 1;
    }
    assert_eq!(expected, 2000);

    let stats = tree.stats().unwrap();
    assert_eq!(stats.entries, 2000);
    Arc::try_unwrap(engine)
        .map_err(|_| ())
        .unwrap()
        .shutdown(false)
        .unwrap();
}

#[test]
fn readers_scan_while_writer_inserts() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::create(dir.path(), concurrent_engine_options()).unwrap());
    engine.create_container(1).unwrap();

    let setup = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &setup, 1, true).unwrap();
    let root = tree.root();
    for i in 0..500u32 {
        tree.insert(&setup, &(i * 4).to_be_bytes(), b"seed").unwrap();
    }
    setup.commit().unwrap();

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let tx = engine.begin().unwrap();
            let tree = BlinkTree::open(engine.txs(), root).unwrap();
            for i in 0..500u32 {
                tree.insert(&tx, &(i * 4 + 1).to_be_bytes(), b"new").unwrap();
            }
            tx.commit().unwrap();
        })
    };

    let mut readers = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        readers.push(thread::spawn(move || {
            for _ in 0..10 {
                let tree = BlinkTree::open(engine.txs(), root).unwrap();
                let mut cursor = tree.open_cursor(SearchMode::First, None, None).unwrap();
                let mut last = None;
                let mut count = 0usize;
                while let Some((key, _)) = cursor.next().unwrap() {
                    if let Some(prev) = last.replace(key.clone()) {
                        assert!(prev < key, "scan must stay sorted under concurrency");
                    }
                    count += 1;
                }
                assert!(count >= 500, "seed entries must always be visible");
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    assert_eq!(tree.stats().unwrap().entries, 1000);
    Arc::try_unwrap(engine)
        .map_err(|_| ())
        .unwrap()
        .shutdown(false)
        .unwrap();
}
