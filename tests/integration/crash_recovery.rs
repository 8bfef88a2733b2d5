#![allow(missing_docs)]

use std::path::Path;
use tempfile::tempdir;
use vellum::buffer::ContainerOptions;
use vellum::types::Lsn;
use vellum::wal::{LogOptions, SyncMode};
use vellum::{BlinkTree, Engine, EngineOptions, PageId, SearchMode};

fn crash_engine_options() -> EngineOptions {
    EngineOptions {
        container: ContainerOptions {
            block_size: 512,
            initial_blocks: 128,
            extend_blocks: 128,
            buffer_frames: 64,
        },
        log: LogOptions {
            segment_bytes: 8 * 1024 * 1024,
            sync_mode: SyncMode::Normal,
        },
    }
}

fn key_of(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

fn reopen(dir: &Path) -> (Engine, vellum::tx::recovery::RecoveryStats) {
    Engine::open(dir, crash_engine_options()).unwrap()
}

fn scan_keys(engine: &Engine, root: PageId) -> Vec<u32> {
    let tree = BlinkTree::open(engine.txs(), root).unwrap();
    let mut cursor = tree.open_cursor(SearchMode::First, None, None).unwrap();
    let mut keys = Vec::new();
    while let Some((key, _)) = cursor.next().unwrap() {
        keys.push(u32::from_be_bytes(key.as_slice().try_into().unwrap()));
    }
    keys
}

#[test]
fn committed_keys_survive_crash_before_page_writeback() {
    let dir = tempdir().unwrap();
    let root = {
        let engine = Engine::create(dir.path(), crash_engine_options()).unwrap();
        engine.create_container(1).unwrap();
        let tx = engine.begin().unwrap();
        let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
        for i in 0..500u32 {
            tree.insert(&tx, &key_of(i), &key_of(i)).unwrap();
        }
        let root = tree.root();
        // Commit forces the log; the crash happens before any checkpoint or
        // page write-back.
        tx.commit().unwrap();
        engine.shutdown(true).unwrap();
        root
    };

    let (engine, stats) = reopen(dir.path());
    assert!(stats.redone > 0, "redo must replay the unwritten pages");
    let keys = scan_keys(&engine, root);
    assert_eq!(keys, (0..500).collect::<Vec<_>>());
    engine.shutdown(false).unwrap();
}

#[test]
fn uncommitted_transaction_is_undone_on_restart() {
    let dir = tempdir().unwrap();
    let root = {
        let engine = Engine::create(dir.path(), crash_engine_options()).unwrap();
        engine.create_container(1).unwrap();

        let tx = engine.begin().unwrap();
        let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
        for i in 0..100u32 {
            tree.insert(&tx, &key_of(i), b"committed").unwrap();
        }
        let root = tree.root();
        tx.commit().unwrap();

        // A second transaction makes changes, including splits, and then the
        // process dies without commit or rollback.
        let doomed = engine.begin().unwrap();
        let tree = BlinkTree::open(engine.txs(), root).unwrap();
        for i in 1000..1400u32 {
            tree.insert(&doomed, &key_of(i), b"doomed").unwrap();
        }
        tree.delete(&doomed, &key_of(42), b"committed").unwrap();
        engine.log().flush_all().unwrap();
        std::mem::forget(doomed);
        engine.shutdown(true).unwrap();
        root
    };

    let (engine, stats) = reopen(dir.path());
    assert_eq!(stats.undone, 1, "the loser transaction must be rolled back");
    let keys = scan_keys(&engine, root);
    assert_eq!(keys, (0..100).collect::<Vec<_>>(), "loser changes must vanish");
    engine.shutdown(false).unwrap();
}

#[test]
fn recovery_is_idempotent_across_repeated_crashes() {
    let dir = tempdir().unwrap();
    let root = {
        let engine = Engine::create(dir.path(), crash_engine_options()).unwrap();
        engine.create_container(1).unwrap();
        let tx = engine.begin().unwrap();
        let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
        for i in 0..300u32 {
            tree.insert(&tx, &key_of(i), &key_of(i)).unwrap();
        }
        let root = tree.root();
        tx.commit().unwrap();
        engine.shutdown(true).unwrap();
        root
    };

    for _ in 0..3 {
        let (engine, _) = reopen(dir.path());
        let keys = scan_keys(&engine, root);
        assert_eq!(keys, (0..300).collect::<Vec<_>>());
        // Crash again right after recovery.
        engine.shutdown(true).unwrap();
    }
}

#[test]
fn checkpoint_bounds_recovery_and_log_retention() {
    let dir = tempdir().unwrap();
    let root = {
        let engine = Engine::create(dir.path(), crash_engine_options()).unwrap();
        engine.create_container(1).unwrap();
        let tx = engine.begin().unwrap();
        let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
        for i in 0..200u32 {
            tree.insert(&tx, &key_of(i), b"first").unwrap();
        }
        let root = tree.root();
        tx.commit().unwrap();

        engine.checkpoint().unwrap();
        let retained_after = engine.min_retained_lsn();

        let tx = engine.begin().unwrap();
        let tree = BlinkTree::open(engine.txs(), root).unwrap();
        for i in 200..400u32 {
            tree.insert(&tx, &key_of(i), b"second").unwrap();
        }
        tx.commit().unwrap();
        engine.shutdown(true).unwrap();
        assert!(retained_after > Lsn(0));
        root
    };

    let (engine, stats) = reopen(dir.path());
    assert!(
        stats.analysis_start > Lsn(1),
        "analysis must start at the checkpoint, not the log head"
    );
    let keys = scan_keys(&engine, root);
    assert_eq!(keys, (0..400).collect::<Vec<_>>());
    engine.shutdown(false).unwrap();
}

#[test]
fn min_redo_lsn_never_exceeds_any_dirty_page() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(dir.path(), crash_engine_options()).unwrap();
    engine.create_container(1).unwrap();

    let tx = engine.begin().unwrap();
    let tree = BlinkTree::create(engine.txs(), &tx, 1, true).unwrap();
    for i in 0..300u32 {
        tree.insert(&tx, &key_of(i), &key_of(i)).unwrap();
    }
    tx.commit().unwrap();

    let dirty = engine.buffers().dirty_pages();
    assert!(!dirty.is_empty(), "workload must leave dirty pages");
    let min_redo = engine.buffers().min_redo_lsn().unwrap();
    for (page, redo) in dirty {
        assert!(min_redo <= redo, "min redo exceeds page {page}");
    }

    engine.checkpoint().unwrap();
    assert_eq!(engine.buffers().min_redo_lsn(), None);
    engine.shutdown(false).unwrap();
}
