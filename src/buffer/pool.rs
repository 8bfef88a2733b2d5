//! Per-container page cache: pinning, clock replacement, dirty tracking,
//! and write-ahead-gated flushing.
//!
//! Latching discipline: a frame latch is only ever acquired through a pinned
//! handle, so a slot with a zero pin count is guaranteed unlatched. Eviction
//! reserves a victim by pinning it, flushes it outside the pool mutex while
//! the old mapping is still visible, and repurposes the slot only after
//! re-checking that nobody re-pinned or re-dirtied it. A page is therefore
//! always clean by the time it leaves the map, and a concurrent re-fix from
//! disk observes exactly the flushed image.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::container::Container;
use super::frame::Frame;
use crate::latch::{
    ExclusiveGuard, Latch, OwnedExclusiveGuard, OwnedSharedGuard, OwnedUpdateGuard, SharedGuard,
    UpdateGuard,
};
use crate::types::{BlockNo, BufferError, Lsn, PageId, Result, StoreError, TxId, UnitId};
use crate::wal::LogManager;

/// Running counters for one pool.
#[derive(Default)]
pub struct BufferStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of [`BufferStats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferStatsSnapshot {
    /// Fix requests satisfied from memory.
    pub hits: u64,
    /// Fix requests that had to read the container.
    pub misses: u64,
    /// Frames repurposed for another page.
    pub evictions: u64,
    /// Page images written back to the container.
    pub flushes: u64,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Residency {
    Resident(usize),
    /// Slot reserved while a load is in flight.
    Pending,
}

struct PoolState {
    map: HashMap<PageId, Residency>,
    resident: Vec<PageId>,
    pins: Vec<u32>,
    refbit: Vec<bool>,
    hand: usize,
}

/// Page cache for one container.
pub struct BufferPool {
    container: Arc<Container>,
    log: Arc<LogManager>,
    slots: Vec<Latch<Frame>>,
    state: Mutex<PoolState>,
    loaded: Condvar,
    stats: BufferStats,
}

impl BufferPool {
    /// Creates a pool of `frames` slots over `container`.
    pub fn new(container: Arc<Container>, log: Arc<LogManager>, frames: usize) -> Arc<Self> {
        let frames = frames.max(4);
        let block_size = container.block_size();
        let slots = (0..frames)
            .map(|_| Latch::new(Frame::new(block_size)))
            .collect();
        Arc::new(Self {
            container,
            log,
            slots,
            state: Mutex::new(PoolState {
                map: HashMap::new(),
                resident: vec![PageId::NONE; frames],
                pins: vec![0; frames],
                refbit: vec![false; frames],
                hand: 0,
            }),
            loaded: Condvar::new(),
            stats: BufferStats::default(),
        })
    }

    /// The container backing this pool.
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Pins `page_id` into the cache, loading it from the container when
    /// absent. Fails for pages that were never allocated or have been freed.
    pub fn fix(self: &Arc<Self>, page_id: PageId) -> Result<PageHandle> {
        loop {
            let mut state = self.state.lock();
            match state.map.get(&page_id).copied() {
                Some(Residency::Resident(slot)) => {
                    state.pins[slot] += 1;
                    state.refbit[slot] = true;
                    drop(state);
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PageHandle {
                        pool: Arc::clone(self),
                        slot,
                        page_id,
                    });
                }
                Some(Residency::Pending) => {
                    self.loaded.wait(&mut state);
                    continue;
                }
                None => {
                    if !self.container.is_allocated(page_id.block()) {
                        return Err(BufferError::PageNotFound(page_id).into());
                    }
                    drop(state);
                    let slot = match self.claim_slot(page_id)? {
                        Some(slot) => slot,
                        None => continue,
                    };
                    let load = self.load_into(slot, page_id);
                    return self.finish_pending(slot, page_id, load);
                }
            }
        }
    }

    /// Allocates a page in `unit` and pins it, without touching the disk
    /// image. `requested` forces the block number (recovery); `assigned_to`
    /// records the allocating transaction on the frame.
    pub fn allocate(
        self: &Arc<Self>,
        unit: UnitId,
        requested: Option<BlockNo>,
        assigned_to: Option<TxId>,
    ) -> Result<PageHandle> {
        let block = self.container.allocate(unit, requested)?;
        let page_id = PageId::new(self.container.no(), block);
        loop {
            let mut state = self.state.lock();
            match state.map.get(&page_id).copied() {
                Some(Residency::Resident(slot)) => {
                    // Recovery may force a block that is still buffered.
                    state.pins[slot] += 1;
                    state.refbit[slot] = true;
                    drop(state);
                    return Ok(PageHandle {
                        pool: Arc::clone(self),
                        slot,
                        page_id,
                    });
                }
                Some(Residency::Pending) => {
                    self.loaded.wait(&mut state);
                    continue;
                }
                None => {
                    drop(state);
                    let slot = match self.claim_slot(page_id)? {
                        Some(slot) => slot,
                        None => continue,
                    };
                    let init: Result<()> = {
                        let mut frame = self.slots[slot].exclusive();
                        debug_assert!(!frame.modified, "claimed slot must be clean");
                        frame.format(unit, 0);
                        frame.page_id = page_id;
                        frame.redo_lsn = None;
                        frame.modified = false;
                        frame.safe = true;
                        frame.assigned_to = assigned_to;
                        Ok(())
                    };
                    return self.finish_pending(slot, page_id, init);
                }
            }
        }
    }

    /// Drops a page from the cache without writing it back. Used after the
    /// page has been freed in the container.
    pub fn discard(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        match state.map.get(&page_id).copied() {
            Some(Residency::Resident(slot)) => {
                if state.pins[slot] > 0 {
                    return Err(StoreError::Invalid("cannot discard a pinned page"));
                }
                state.map.remove(&page_id);
                state.resident[slot] = PageId::NONE;
                state.refbit[slot] = false;
                drop(state);
                let mut frame = self.slots[slot].exclusive();
                frame.page_id = PageId::NONE;
                frame.modified = false;
                frame.redo_lsn = None;
                frame.safe = true;
                frame.assigned_to = None;
                Ok(())
            }
            Some(Residency::Pending) => Err(StoreError::Invalid("cannot discard a loading page")),
            None => Ok(()),
        }
    }

    /// Writes every dirty frame back to the container, forcing the log first
    /// (write-ahead rule), and persists allocation metadata.
    pub fn flush_all(self: &Arc<Self>) -> Result<()> {
        for slot in 0..self.slots.len() {
            if let Some(handle) = self.pin_slot(slot) {
                handle.flush()?;
            }
        }
        self.container.flush_meta()?;
        Ok(())
    }

    /// Flushes the frames whose pages were allocated by `tx`.
    pub fn flush_assigned(self: &Arc<Self>, tx: TxId) -> Result<()> {
        for slot in 0..self.slots.len() {
            if let Some(handle) = self.pin_slot(slot) {
                let assigned = handle.shared().assigned_to == Some(tx);
                if assigned {
                    handle.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Minimum `redo_lsn` across the dirty frames of this pool, or `None`
    /// when every frame is clean.
    pub fn min_redo_lsn(self: &Arc<Self>) -> Option<Lsn> {
        let mut min = None;
        for slot in 0..self.slots.len() {
            if let Some(handle) = self.pin_slot(slot) {
                let redo = handle.shared().redo_lsn;
                min = match (min, redo) {
                    (None, redo) => redo,
                    (cur, None) => cur,
                    (Some(a), Some(b)) => Some(a.min(b)),
                };
            }
        }
        min
    }

    /// Pages currently dirty in this pool with their redo LSNs; feeds the
    /// dirty-page table of a fuzzy checkpoint.
    pub fn dirty_pages(self: &Arc<Self>) -> Vec<(PageId, Lsn)> {
        let mut dirty = Vec::new();
        for slot in 0..self.slots.len() {
            if let Some(handle) = self.pin_slot(slot) {
                let frame = handle.shared();
                if let Some(redo) = frame.redo_lsn {
                    dirty.push((frame.page_id, redo));
                }
            }
        }
        dirty
    }

    /// Clears the safe flag on a resident page, forcing cursors that cached
    /// a position on it to re-descend.
    pub fn mark_unsafe(self: &Arc<Self>, page_id: PageId) {
        if let Some(handle) = self.try_pin_page(page_id) {
            handle.exclusive().safe = false;
        }
    }

    /// Counter snapshot for diagnostics.
    pub fn stats(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
        }
    }

    /// Forces container contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.container.sync()
    }

    /// Flushes (unless `force`) and quiesces the pool.
    pub fn shutdown(self: &Arc<Self>, force: bool) -> Result<()> {
        if !force {
            self.flush_all()?;
            self.sync()?;
        }
        debug!(container = self.container.no(), force, "buffer pool shut down");
        Ok(())
    }

    fn pin_slot(self: &Arc<Self>, slot: usize) -> Option<PageHandle> {
        let mut state = self.state.lock();
        let page_id = state.resident[slot];
        if page_id.is_none() {
            return None;
        }
        if state.map.get(&page_id) != Some(&Residency::Resident(slot)) {
            return None;
        }
        state.pins[slot] += 1;
        Some(PageHandle {
            pool: Arc::clone(self),
            slot,
            page_id,
        })
    }

    fn try_pin_page(self: &Arc<Self>, page_id: PageId) -> Option<PageHandle> {
        let mut state = self.state.lock();
        match state.map.get(&page_id).copied() {
            Some(Residency::Resident(slot)) => {
                state.pins[slot] += 1;
                Some(PageHandle {
                    pool: Arc::clone(self),
                    slot,
                    page_id,
                })
            }
            _ => None,
        }
    }

    /// Claims a frame for `page_id`: picks a victim, flushes it while its
    /// old mapping is still visible, and installs a `Pending` mapping with
    /// one reservation pin. Returns `None` when the claim raced with another
    /// thread and the caller should re-run its map lookup.
    fn claim_slot(&self, page_id: PageId) -> Result<Option<usize>> {
        loop {
            let victim = {
                let mut state = self.state.lock();
                if state.map.contains_key(&page_id) {
                    return Ok(None);
                }
                let victim = self.pick_victim(&mut state)?;
                state.pins[victim] = 1;
                victim
            };

            let flushed = self.flush_victim(victim);
            if let Err(err) = flushed {
                let mut state = self.state.lock();
                state.pins[victim] -= 1;
                return Err(err);
            }

            let mut state = self.state.lock();
            let stable = {
                // Pin count 1 means nobody else touched the slot during the
                // flush; the frame latch is free, so the peek cannot block.
                state.pins[victim] == 1 && !self.slots[victim].shared().modified
            };
            if !stable {
                state.pins[victim] -= 1;
                state.refbit[victim] = true;
                continue;
            }
            let old_page = state.resident[victim];
            if !old_page.is_none() {
                state.map.remove(&old_page);
            }
            state.resident[victim] = page_id;
            state.map.insert(page_id, Residency::Pending);
            return Ok(Some(victim));
        }
    }

    fn flush_victim(&self, slot: usize) -> Result<()> {
        let guard = self.slots[slot].update();
        if !guard.modified || guard.page_id.is_none() {
            return Ok(());
        }
        let mut guard = guard.upgrade();
        self.write_back(&mut guard)?;
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pick_victim(&self, state: &mut PoolState) -> Result<usize> {
        let n = self.slots.len();
        for _ in 0..(2 * n) {
            let slot = state.hand;
            state.hand = (state.hand + 1) % n;
            if state.pins[slot] > 0 {
                continue;
            }
            if state.refbit[slot] {
                state.refbit[slot] = false;
                continue;
            }
            return Ok(slot);
        }
        warn!(container = self.container.no(), "buffer pool exhausted");
        Err(BufferError::NoFreeFrames.into())
    }

    fn load_into(&self, slot: usize, page_id: PageId) -> Result<()> {
        let mut frame = self.slots[slot].exclusive();
        debug_assert!(!frame.modified, "claimed slot must be clean");
        self.container.read_block(page_id.block(), frame.data_mut())?;
        frame.adopt_image(page_id);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish_pending(
        self: &Arc<Self>,
        slot: usize,
        page_id: PageId,
        outcome: Result<()>,
    ) -> Result<PageHandle> {
        let mut state = self.state.lock();
        match outcome {
            Ok(()) => {
                state.map.insert(page_id, Residency::Resident(slot));
                state.refbit[slot] = true;
                drop(state);
                self.loaded.notify_all();
                Ok(PageHandle {
                    pool: Arc::clone(self),
                    slot,
                    page_id,
                })
            }
            Err(err) => {
                state.map.remove(&page_id);
                state.resident[slot] = PageId::NONE;
                state.pins[slot] = 0;
                drop(state);
                self.loaded.notify_all();
                Err(err)
            }
        }
    }

    /// Writes one dirty frame to the container after forcing the log through
    /// the frame's last LSN.
    fn write_back(&self, frame: &mut Frame) -> Result<()> {
        self.log.flush_through(frame.lsn)?;
        self.container
            .write_block(frame.page_id.block(), frame.data())?;
        frame.modified = false;
        frame.redo_lsn = None;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unfix(&self, slot: usize) {
        let mut state = self.state.lock();
        debug_assert!(state.pins[slot] > 0);
        state.pins[slot] -= 1;
    }
}

/// A pinned page. The pin is released on drop; latching happens through the
/// handle while the pin is held.
pub struct PageHandle {
    pool: Arc<BufferPool>,
    slot: usize,
    page_id: PageId,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("slot", &self.slot)
            .field("page_id", &self.page_id)
            .finish_non_exhaustive()
    }
}

impl PageHandle {
    /// Identity of the pinned page.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latch the page in shared mode.
    pub fn shared(&self) -> SharedGuard<'_, Frame> {
        self.pool.slots[self.slot].shared()
    }

    /// Latch the page in update mode.
    pub fn update(&self) -> UpdateGuard<'_, Frame> {
        self.pool.slots[self.slot].update()
    }

    /// Latch the page in exclusive mode.
    pub fn exclusive(&self) -> ExclusiveGuard<'_, Frame> {
        self.pool.slots[self.slot].exclusive()
    }

    /// Owned shared-mode latch; survives moves of the handle.
    pub fn shared_owned(&self) -> OwnedSharedGuard<Frame> {
        self.pool.slots[self.slot].shared_owned()
    }

    /// Owned update-mode latch.
    pub fn update_owned(&self) -> OwnedUpdateGuard<Frame> {
        self.pool.slots[self.slot].update_owned()
    }

    /// Owned exclusive-mode latch.
    pub fn exclusive_owned(&self) -> OwnedExclusiveGuard<Frame> {
        self.pool.slots[self.slot].exclusive_owned()
    }

    /// Flushes this page if dirty, honoring the write-ahead rule.
    pub fn flush(&self) -> Result<()> {
        let guard = self.update();
        if !guard.modified {
            return Ok(());
        }
        let mut guard = guard.upgrade();
        self.pool.write_back(&mut guard)
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pool.unfix(self.slot);
    }
}
