//! ARIES-style restart recovery: analysis, redo, undo.
//!
//! Analysis scans forward from the last checkpoint reconstructing the
//! active-transaction table and dirty-page table. Redo repeats history from
//! the earliest dirty-page redo LSN, gated per page on the embedded page LSN
//! so it is idempotent. Undo then rolls back every transaction that was
//! neither committed nor fully aborted, through the same compensation-logged
//! path ordinary rollback uses. Transactions whose commit record made it to
//! disk but whose completion did not are finished here, including their
//! deferred deallocations.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::{TxManager, TxState};
use crate::index;
use crate::types::{BufferError, Lsn, PageId, Result, StoreError, TxId};
use crate::wal::{DeferredAction, LogRecordBody};

/// Counters reported after a recovery run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryStats {
    /// Where the analysis scan started.
    pub analysis_start: Lsn,
    /// Page-level changes reapplied during redo.
    pub redone: usize,
    /// Loser transactions rolled back.
    pub undone: usize,
    /// Committed transactions whose completion was finished here.
    pub completed: usize,
}

#[derive(Default)]
struct TxMeta {
    last_lsn: Lsn,
    undo_next: Lsn,
    committed: bool,
    aborted: bool,
    deferred: Vec<DeferredAction>,
}

/// Runs the full three-pass protocol. Call once at engine open, after the
/// containers are attached and before any transaction begins.
pub fn recover(mgr: &Arc<TxManager>) -> Result<RecoveryStats> {
    let log = mgr.log();
    let start = log.read_master()?.unwrap_or_else(|| log.first_lsn());
    let mut stats = RecoveryStats {
        analysis_start: start,
        ..RecoveryStats::default()
    };

    // Analysis.
    let mut att: HashMap<TxId, TxMeta> = HashMap::new();
    let mut dpt: HashMap<PageId, Lsn> = HashMap::new();
    let mut max_tx = TxId(0);
    for item in log.scan_from(start) {
        let (lsn, record) = item?;
        max_tx = max_tx.max(record.tx);
        match &record.body {
            LogRecordBody::Checkpoint { active, dirty } => {
                for entry in active {
                    att.entry(entry.tx).or_insert_with(|| TxMeta {
                        last_lsn: entry.last_lsn,
                        undo_next: entry.undo_next,
                        ..TxMeta::default()
                    });
                }
                for entry in dirty {
                    dpt.entry(entry.page).or_insert(entry.redo_lsn);
                }
            }
            LogRecordBody::Begin => {
                att.insert(
                    record.tx,
                    TxMeta {
                        last_lsn: lsn,
                        undo_next: lsn,
                        ..TxMeta::default()
                    },
                );
            }
            LogRecordBody::Commit { deferred } => {
                let meta = att.entry(record.tx).or_default();
                meta.last_lsn = lsn;
                meta.committed = true;
                meta.deferred = deferred.clone();
            }
            LogRecordBody::Abort => {
                let meta = att.entry(record.tx).or_default();
                meta.last_lsn = lsn;
                meta.aborted = true;
            }
            LogRecordBody::End => {
                att.remove(&record.tx);
            }
            _ => {
                let meta = att.entry(record.tx).or_default();
                meta.last_lsn = lsn;
                meta.undo_next = record.undo_next().unwrap_or(lsn);
                for page in record.touched_pages() {
                    dpt.entry(page).or_insert(lsn);
                }
            }
        }
    }
    mgr.bump_next_tx(max_tx);
    info!(
        start = start.0,
        active = att.len(),
        dirty = dpt.len(),
        "recovery analysis complete"
    );

    // Redo: repeat history from the earliest missing change.
    let redo_start = dpt.values().min().copied().unwrap_or(start).min(start);
    for item in log.scan_from(redo_start) {
        let (lsn, record) = item?;
        match &record.body {
            LogRecordBody::CreateUnit { container, unit } => {
                mgr.buffers().pool(*container)?.container().create_unit_at(*unit)?;
            }
            LogRecordBody::DropUnit { container, unit }
            | LogRecordBody::CompensateUnit {
                container, unit, ..
            } => {
                let pool = mgr.buffers().pool(*container)?;
                match pool.container().drop_unit(*unit) {
                    Ok(freed) => {
                        for block in freed {
                            pool.discard(PageId::new(*container, block))?;
                        }
                    }
                    Err(StoreError::Buffer(BufferError::UnitNotFound(_))) => {}
                    Err(err) => return Err(err),
                }
            }
            LogRecordBody::AllocPage { page, unit } => {
                let pool = mgr.buffers().pool(page.container())?;
                match pool.container().allocate(*unit, Some(page.block())) {
                    Ok(_) => {}
                    // A later drop of the unit supersedes this allocation.
                    Err(StoreError::Buffer(BufferError::UnitNotFound(_))) => {}
                    Err(err) => return Err(err),
                }
            }
            LogRecordBody::FreePage { page, .. }
            | LogRecordBody::CompensateAlloc { page, .. } => {
                let pool = mgr.buffers().pool(page.container())?;
                pool.discard(*page)?;
                pool.container().free(page.block())?;
            }
            body => {
                for page in record.touched_pages() {
                    let Some(&first_lsn) = dpt.get(&page) else {
                        continue;
                    };
                    if lsn < first_lsn {
                        continue;
                    }
                    let pool = mgr.buffers().pool(page.container())?;
                    let handle = match pool.fix(page) {
                        Ok(handle) => handle,
                        // Freed later in the log; the final state has no page.
                        Err(StoreError::Buffer(BufferError::PageNotFound(_))) => continue,
                        Err(err) => return Err(err),
                    };
                    let mut frame = handle.exclusive();
                    if frame.lsn < lsn {
                        index::redo_apply(body, page, &mut frame)?;
                        frame.mark_dirty(lsn);
                        frame.safe = false;
                        stats.redone += 1;
                    }
                }
            }
        }
    }
    info!(redone = stats.redone, "recovery redo complete");

    // Completion of transactions past their commit or abort point.
    for (id, meta) in att.iter().filter(|(_, meta)| meta.committed || meta.aborted) {
        let tx = mgr.adopt_recovered(*id, meta.last_lsn, meta.undo_next);
        if meta.committed {
            tx.set_state(TxState::Committed);
            mgr.apply_deferred(&tx, &meta.deferred)?;
            mgr.log_update(&tx, LogRecordBody::End)?;
        } else {
            mgr.log_update(&tx, LogRecordBody::End)?;
            tx.set_state(TxState::Aborted);
        }
        mgr.forget(*id);
        stats.completed += 1;
    }

    // Undo of losers.
    for (id, meta) in att.iter().filter(|(_, meta)| !meta.committed && !meta.aborted) {
        let tx = mgr.adopt_recovered(*id, meta.last_lsn, meta.undo_next);
        if let Err(err) = mgr.rollback_inner(&tx) {
            warn!(tx = %id, error = %err, "loser rollback failed");
            return Err(err);
        }
        stats.undone += 1;
    }
    mgr.log().flush_all()?;
    info!(
        undone = stats.undone,
        completed = stats.completed,
        "recovery complete"
    );
    Ok(stats)
}
