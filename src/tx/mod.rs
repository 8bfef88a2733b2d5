//! Transaction manager: lifecycle state machine, update logging, rollback
//! with compensation records, deferred deallocation, and pre-commit hooks.

pub mod locks;
pub mod recovery;

pub use locks::{LockMode, LockTable};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::BufferManager;
use crate::types::{ContainerNo, Lsn, PageId, Result, StoreError, TxError, TxId, UnitId};
use crate::wal::{
    ActiveTxEntry, DeferredAction, DirtyPageEntry, LogManager, LogRecord, LogRecordBody,
};

/// Transaction lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Commit processing has begun.
    Committing,
    /// Commit record is durable.
    Committed,
    /// Rollback in progress.
    Aborting,
    /// Rollback completed.
    Aborted,
}

impl TxState {
    fn name(self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::Aborting => "aborting",
            TxState::Aborted => "aborted",
        }
    }
}

type CommitHook = Box<dyn FnOnce(&TxHandle) -> Result<()> + Send>;

struct TxInner {
    state: TxState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    undo_next: Lsn,
    deferred: Vec<DeferredAction>,
    hooks: Vec<CommitHook>,
}

/// One transaction's durable identity and volatile bookkeeping.
pub struct Transaction {
    id: TxId,
    inner: Mutex<TxInner>,
}

impl Transaction {
    fn new(id: TxId, state: TxState) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(TxInner {
                state,
                first_lsn: Lsn(0),
                last_lsn: Lsn(0),
                undo_next: Lsn(0),
                deferred: Vec::new(),
                hooks: Vec::new(),
            }),
        })
    }

    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// LSN of this transaction's most recent log record.
    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    pub(crate) fn set_state(&self, state: TxState) {
        self.inner.lock().state = state;
    }
}

/// Tracks all live transactions and drives logging, commit, rollback, and
/// checkpointing. One per engine instance.
pub struct TxManager {
    log: Arc<LogManager>,
    buffers: Arc<BufferManager>,
    locks: LockTable,
    next_tx: AtomicU64,
    active: Mutex<HashMap<TxId, Arc<Transaction>>>,
}

impl TxManager {
    /// Creates a manager over the shared log and buffer registry.
    pub fn new(log: Arc<LogManager>, buffers: Arc<BufferManager>) -> Arc<Self> {
        Arc::new(Self {
            log,
            buffers,
            locks: LockTable::new(Duration::from_secs(5)),
            next_tx: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// The lock service collaborators acquire transaction-duration locks
    /// through.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Buffer registry accessor.
    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    /// Log manager accessor.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Number of transactions currently registered.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Starts a transaction: allocates an id and logs its begin record.
    pub fn begin(self: &Arc<Self>) -> Result<TxHandle> {
        let id = TxId(self.next_tx.fetch_add(1, Ordering::Relaxed));
        let tx = Transaction::new(id, TxState::Active);
        self.log_update(&tx, LogRecordBody::Begin)?;
        self.active.lock().insert(id, Arc::clone(&tx));
        debug!(tx = %id, "transaction started");
        Ok(TxHandle {
            mgr: Arc::clone(self),
            tx,
            finished: false,
        })
    }

    /// Appends one record on behalf of `tx`, chaining `prev_lsn` and
    /// advancing the undo position.
    pub(crate) fn log_update(&self, tx: &Transaction, body: LogRecordBody) -> Result<Lsn> {
        let mut inner = tx.inner.lock();
        if matches!(inner.state, TxState::Aborted) {
            return Err(TxError::InvalidState {
                state: inner.state.name(),
                op: "log update",
            }
            .into());
        }
        let record = LogRecord {
            tx: tx.id,
            prev_lsn: inner.last_lsn,
            body,
        };
        let undo_next = record.undo_next();
        let lsn = self.log.append(&record)?;
        if inner.first_lsn.0 == 0 {
            inner.first_lsn = lsn;
        }
        inner.last_lsn = lsn;
        inner.undo_next = undo_next.unwrap_or(lsn);
        Ok(lsn)
    }

    /// First LSN of the oldest registered transaction; bounds log
    /// truncation together with the minimum redo LSN.
    pub fn oldest_active_first_lsn(&self) -> Option<Lsn> {
        self.active
            .lock()
            .values()
            .filter_map(|tx| {
                let first = tx.inner.lock().first_lsn;
                (first.0 != 0).then_some(first)
            })
            .min()
    }

    /// Takes a fuzzy checkpoint: logs the active-transaction table and
    /// dirty-page table, forces the log, and persists the master pointer.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let active: Vec<ActiveTxEntry> = self
            .active
            .lock()
            .values()
            .map(|tx| {
                let inner = tx.inner.lock();
                ActiveTxEntry {
                    tx: tx.id,
                    last_lsn: inner.last_lsn,
                    undo_next: inner.undo_next,
                }
            })
            .collect();
        let dirty: Vec<DirtyPageEntry> = self
            .buffers
            .dirty_pages()
            .into_iter()
            .map(|(page, redo_lsn)| DirtyPageEntry { page, redo_lsn })
            .collect();
        let record = LogRecord {
            tx: TxId(0),
            prev_lsn: Lsn(0),
            body: LogRecordBody::Checkpoint {
                active: active.clone(),
                dirty: dirty.clone(),
            },
        };
        let lsn = self.log.append(&record)?;
        self.log.flush_all()?;
        self.log.write_master(lsn)?;
        info!(
            lsn = lsn.0,
            active = active.len(),
            dirty = dirty.len(),
            "checkpoint taken"
        );
        Ok(lsn)
    }

    pub(crate) fn adopt_recovered(
        self: &Arc<Self>,
        id: TxId,
        last_lsn: Lsn,
        undo_next: Lsn,
    ) -> Arc<Transaction> {
        let tx = Transaction::new(id, TxState::Aborting);
        {
            let mut inner = tx.inner.lock();
            inner.last_lsn = last_lsn;
            inner.undo_next = undo_next;
            inner.first_lsn = last_lsn;
        }
        self.active.lock().insert(id, Arc::clone(&tx));
        tx
    }

    pub(crate) fn bump_next_tx(&self, seen: TxId) {
        let floor = seen.0 + 1;
        self.next_tx.fetch_max(floor, Ordering::Relaxed);
    }

    pub(crate) fn forget(&self, id: TxId) {
        self.active.lock().remove(&id);
    }

    fn commit_inner(self: &Arc<Self>, handle: &TxHandle) -> Result<()> {
        let tx = &handle.tx;
        let hooks = {
            let mut inner = tx.inner.lock();
            if inner.state != TxState::Active {
                return Err(TxError::InvalidState {
                    state: inner.state.name(),
                    op: "commit",
                }
                .into());
            }
            inner.state = TxState::Committing;
            std::mem::take(&mut inner.hooks)
        };

        for hook in hooks {
            if let Err(err) = hook(handle) {
                warn!(tx = %tx.id, error = %err, "pre-commit hook failed, rolling back");
                self.rollback_inner(tx)?;
                return Err(err);
            }
        }

        let deferred = tx.inner.lock().deferred.clone();
        self.log_update(tx, LogRecordBody::Commit {
            deferred: deferred.clone(),
        })?;
        self.log.flush_all()?;
        {
            tx.inner.lock().state = TxState::Committed;
        }

        self.apply_deferred(tx, &deferred)?;
        self.locks.release_all(tx.id);
        self.log_update(tx, LogRecordBody::End)?;
        self.active.lock().remove(&tx.id);
        debug!(tx = %tx.id, "transaction committed");
        Ok(())
    }

    /// Applies deferred deallocations after the commit record is durable,
    /// logging each one. Also used by recovery completion.
    pub(crate) fn apply_deferred(
        self: &Arc<Self>,
        tx: &Transaction,
        deferred: &[DeferredAction],
    ) -> Result<()> {
        for action in deferred {
            match *action {
                DeferredAction::FreePage { page, unit } => {
                    self.log_update(tx, LogRecordBody::FreePage { page, unit })?;
                    let pool = self.buffers.pool(page.container())?;
                    pool.discard(page)?;
                    pool.container().free(page.block())?;
                }
                DeferredAction::DropUnit { container, unit } => {
                    self.log_update(tx, LogRecordBody::DropUnit { container, unit })?;
                    let pool = self.buffers.pool(container)?;
                    match pool.container().drop_unit(unit) {
                        Ok(freed) => {
                            for block in freed {
                                pool.discard(PageId::new(container, block))?;
                            }
                        }
                        Err(StoreError::Buffer(crate::types::BufferError::UnitNotFound(_))) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }

    /// Walks the undo chain, compensating every undoable record, then logs
    /// abort and end. Also used by recovery for loser transactions.
    pub(crate) fn rollback_inner(self: &Arc<Self>, tx: &Arc<Transaction>) -> Result<()> {
        let mut next = {
            let mut inner = tx.inner.lock();
            match inner.state {
                TxState::Active | TxState::Committing | TxState::Aborting => {}
                state => {
                    return Err(TxError::InvalidState {
                        state: state.name(),
                        op: "rollback",
                    }
                    .into())
                }
            }
            inner.state = TxState::Aborting;
            inner.undo_next
        };

        while next.0 != 0 {
            let record = self.log.get(next)?;
            use LogRecordBody::*;
            match record.body {
                Begin => break,
                InsertEntry {
                    root, key, value, ..
                } => {
                    crate::index::undo_insert(self, tx, root, &key, &value, record.prev_lsn)?;
                    next = record.prev_lsn;
                }
                DeleteEntry {
                    root,
                    key,
                    value,
                    vflags,
                    ..
                } => {
                    crate::index::undo_delete(
                        self,
                        tx,
                        root,
                        &key,
                        &value,
                        vflags,
                        record.prev_lsn,
                    )?;
                    next = record.prev_lsn;
                }
                AllocPage { page, unit } => {
                    self.log_update(
                        tx,
                        CompensateAlloc {
                            page,
                            unit,
                            undo_next: record.prev_lsn,
                        },
                    )?;
                    let pool = self.buffers.pool(page.container())?;
                    pool.discard(page)?;
                    pool.container().free(page.block())?;
                    next = record.prev_lsn;
                }
                CreateUnit { container, unit } => {
                    self.log_update(
                        tx,
                        CompensateUnit {
                            container,
                            unit,
                            undo_next: record.prev_lsn,
                        },
                    )?;
                    let pool = self.buffers.pool(container)?;
                    match pool.container().drop_unit(unit) {
                        Ok(freed) => {
                            for block in freed {
                                pool.discard(PageId::new(container, block))?;
                            }
                        }
                        Err(StoreError::Buffer(crate::types::BufferError::UnitNotFound(_))) => {}
                        Err(err) => return Err(err),
                    }
                    next = record.prev_lsn;
                }
                // Structural records stay: an uncompensated split or posting
                // leaves a consistent B-link tree (high keys plus sibling
                // chain), so undo passes over them.
                FormatPage { .. } | OverflowPage { .. } | SplitPage { .. } | RootGrow { .. }
                | PostSeparator { .. } => {
                    next = record.prev_lsn;
                }
                SmoDone { undo_next }
                | CompensateInsert { undo_next, .. }
                | CompensateDelete { undo_next, .. }
                | CompensateAlloc { undo_next, .. }
                | CompensateUnit { undo_next, .. } => {
                    next = undo_next;
                }
                FreePage { .. } | DropUnit { .. } | Commit { .. } | End | Abort
                | Checkpoint { .. } => {
                    warn!(tx = %tx.id, lsn = next.0, "unexpected record in undo chain");
                    break;
                }
            }
            tx.inner.lock().undo_next = next;
        }

        self.log_update(tx, LogRecordBody::Abort)?;
        self.locks.release_all(tx.id);
        {
            tx.inner.lock().state = TxState::Aborted;
        }
        self.log_update(tx, LogRecordBody::End)?;
        self.active.lock().remove(&tx.id);
        debug!(tx = %tx.id, "transaction rolled back");
        Ok(())
    }
}

/// Owning handle for one transaction; the public API surface for begin,
/// operate, commit or rollback.
pub struct TxHandle {
    mgr: Arc<TxManager>,
    tx: Arc<Transaction>,
    finished: bool,
}

impl TxHandle {
    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.tx.id
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.tx.state()
    }

    pub(crate) fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    /// Registers a hook to run at the start of commit processing, before the
    /// commit record is written. A failing hook aborts the transaction.
    pub fn on_commit(&self, hook: impl FnOnce(&TxHandle) -> Result<()> + Send + 'static) {
        self.tx.inner.lock().hooks.push(Box::new(hook));
    }

    /// Schedules a page deallocation for after commit, so undo of earlier
    /// records can still reach the page.
    pub fn defer_free_page(&self, page: PageId, unit: UnitId) {
        self.tx
            .inner
            .lock()
            .deferred
            .push(DeferredAction::FreePage { page, unit });
    }

    /// Schedules a whole-unit deallocation for after commit.
    pub fn defer_drop_unit(&self, container: ContainerNo, unit: UnitId) {
        self.tx
            .inner
            .lock()
            .deferred
            .push(DeferredAction::DropUnit { container, unit });
    }

    /// Acquires a transaction-duration lock through the lock service.
    pub fn lock(&self, key: &[u8], mode: LockMode) -> Result<()> {
        self.mgr.locks.acquire(self.tx.id, key, mode)
    }

    /// Commits: runs hooks, writes and forces the commit record, applies
    /// deferred deallocations, and releases locks.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let mgr = Arc::clone(&self.mgr);
        mgr.commit_inner(&self)
    }

    /// Rolls back every logged change with compensation records.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let mgr = Arc::clone(&self.mgr);
        let tx = Arc::clone(&self.tx);
        mgr.rollback_inner(&tx)
    }
}

impl Drop for TxHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.tx.state() == TxState::Active {
            warn!(tx = %self.tx.id, "transaction handle dropped, rolling back");
            if let Err(err) = self.mgr.rollback_inner(&self.tx) {
                warn!(tx = %self.tx.id, error = %err, "implicit rollback failed");
            }
        }
    }
}
