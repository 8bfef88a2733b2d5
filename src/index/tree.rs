//! The B-link tree: latch-coupled descent over buffered pages, logged
//! inserts and deletes, and structural modifications bracketed as nested top
//! actions.
//!
//! Descent acquires one page latch at a time and never holds a parent latch
//! while taking a child's. The safety net for the resulting races is the
//! B-link invariant: every page carries an exclusive upper bound (high key)
//! and a right-sibling pointer, so an operation that lands on a page whose
//! bound was overtaken by a concurrent split simply moves right. Splits keep
//! the root's page id stable by copying the old root aside and rewriting the
//! root in place as a two-child branch.

use smallvec::SmallVec;
use std::sync::Arc;

use tracing::{debug, info};

use super::page::{
    self, bound, encode_overflow_ref, overflow, PageKind, PageMut, PageView, Target,
    FLAG_UNIQUE, VFLAG_OVERFLOW,
};
use crate::buffer::{BufferPool, Frame, PageHandle};
use crate::latch::{OwnedExclusiveGuard, OwnedSharedGuard};
use crate::tx::{Transaction, TxHandle, TxManager};
use crate::types::{
    BufferError, ContainerNo, IndexError, Lsn, PageId, Result, StoreError, UnitId,
};
use crate::wal::LogRecordBody;

/// How a delete matches the entry's value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ValueMatch {
    /// Compare the caller's bytes against the materialized value, resolving
    /// overflow references.
    Semantic,
    /// Compare against the stored bytes exactly; used by undo, which replays
    /// the stored form from the log record.
    Stored,
}

/// A pinned, shared-latched page.
pub(crate) struct ReadPage {
    pub guard: OwnedSharedGuard<Frame>,
    pub handle: PageHandle,
}

/// A pinned, exclusively latched page.
pub(crate) struct WritePage {
    pub guard: OwnedExclusiveGuard<Frame>,
    pub handle: PageHandle,
}

type BranchPath = SmallVec<[PageId; 8]>;

/// A concurrent ordered index over one storage unit of a container.
pub struct BlinkTree {
    mgr: Arc<TxManager>,
    pool: Arc<BufferPool>,
    root: PageId,
    unit: UnitId,
    unique: bool,
}

impl BlinkTree {
    /// Creates a new index: a fresh unit and a formatted empty root leaf,
    /// all logged under `tx`.
    pub fn create(
        mgr: &Arc<TxManager>,
        tx: &TxHandle,
        container: ContainerNo,
        unique: bool,
    ) -> Result<BlinkTree> {
        let pool = mgr.buffers().pool(container)?;
        let unit = pool.container().create_unit()?;
        mgr.log_update(
            tx.transaction(),
            LogRecordBody::CreateUnit { container, unit },
        )?;
        let handle = pool.allocate(unit, None, Some(tx.id()))?;
        let root = handle.page_id();
        mgr.log_update(
            tx.transaction(),
            LogRecordBody::AllocPage { page: root, unit },
        )?;
        let flags = if unique { FLAG_UNIQUE } else { 0 };
        let lsn = mgr.log_update(
            tx.transaction(),
            LogRecordBody::FormatPage {
                root,
                page: root,
                unit,
                kind: PageKind::Leaf as u8,
                flags,
            },
        )?;
        {
            let mut guard = handle.exclusive_owned();
            PageMut::format(guard.data_mut(), root, PageKind::Leaf, 0, flags, None, None)?;
            guard.mark_dirty(lsn);
        }
        info!(root = %root, unique, "created index");
        Ok(BlinkTree {
            mgr: Arc::clone(mgr),
            pool,
            root,
            unit,
            unique,
        })
    }

    /// Opens an existing index by its root page.
    pub fn open(mgr: &Arc<TxManager>, root: PageId) -> Result<BlinkTree> {
        let pool = mgr.buffers().pool(root.container())?;
        let handle = pool.fix(root)?;
        let (unit, unique) = {
            let guard = handle.shared_owned();
            let view = PageView::parse(guard.data())?;
            (guard.unit, view.unique())
        };
        Ok(BlinkTree {
            mgr: Arc::clone(mgr),
            pool,
            root,
            unit,
            unique,
        })
    }

    /// Root page id; stable for the lifetime of the index.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Unit holding every page of this index.
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// True when keys are unique.
    pub fn unique(&self) -> bool {
        self.unique
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Schedules the whole index for deallocation at `tx` commit.
    pub fn drop_index(&self, tx: &TxHandle) {
        tx.defer_drop_unit(self.pool.container().no(), self.unit);
    }

    fn block_size(&self) -> usize {
        self.pool.container().block_size()
    }

    fn max_key_len(&self) -> usize {
        self.block_size() / 8
    }

    fn max_inline_value(&self) -> usize {
        self.block_size() / 4
    }

    /// Inserts `(key, value)`. Oversized values move to an overflow chain
    /// with only a reference kept in the leaf.
    pub fn insert(&self, tx: &TxHandle, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::Invalid("empty keys are not supported"));
        }
        if key.len() > self.max_key_len() {
            return Err(StoreError::Invalid("key exceeds maximum length"));
        }
        let (stored, vflags) = self.externalize_value(tx.transaction(), value)?;
        self.insert_stored(tx.transaction(), key, &stored, vflags, None)
    }

    /// Deletes the entry matching `(key, value)` semantically. Overflow
    /// chains referenced by the removed entry are freed at commit.
    pub fn delete(&self, tx: &TxHandle, key: &[u8], value: &[u8]) -> Result<()> {
        let (stored, vflags) =
            self.delete_matching(tx.transaction(), key, value, ValueMatch::Semantic, None)?;
        if vflags & VFLAG_OVERFLOW != 0 {
            let (head, _) = decode_overflow_ref(&stored)?;
            for chain_page in self.overflow_chain(head)? {
                tx.defer_free_page(chain_page, self.unit);
            }
        }
        Ok(())
    }

    /// Opens a range cursor positioned per `mode`. `key` seeds the
    /// positioning modes; `max_key` is an inclusive upper bound for the
    /// iteration.
    pub fn open_cursor(
        &self,
        mode: super::cursor::SearchMode,
        key: Option<&[u8]>,
        max_key: Option<&[u8]>,
    ) -> Result<super::cursor::Cursor<'_>> {
        super::cursor::Cursor::open(self, mode, key, max_key)
    }

    /// Largest entry at or before `bound` (`None` means the very last entry
    /// of the index). Returns the holding leaf and the stored pair.
    pub(crate) fn find_less_or_equal(
        &self,
        bound: Option<&Target<'_>>,
    ) -> Result<Option<(PageId, Vec<u8>, Vec<u8>)>> {
        self.find_le_in(self.root, bound)
    }

    fn find_le_in(
        &self,
        page_id: PageId,
        bound: Option<&Target<'_>>,
    ) -> Result<Option<(PageId, Vec<u8>, Vec<u8>)>> {
        let mut current = page_id;
        loop {
            let page = match self.read_latched(current) {
                Ok(page) => page,
                Err(StoreError::Buffer(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            let view = PageView::parse(page.guard.data())?;
            // Everything at or past the high key may still be <= bound, so
            // walk right as long as the bound exceeds this page.
            let walk_right = match bound {
                Some(bound) => !view.covers(bound)?,
                None => true,
            };
            if walk_right {
                if let Some(next) = view.right_sibling() {
                    current = next;
                    continue;
                }
            }
            if view.is_leaf() {
                let idx = match bound {
                    None => view.entry_count(),
                    Some(bound) => match view.leaf_position(bound)? {
                        Ok(found) => found + 1,
                        Err(insert_at) => insert_at,
                    },
                };
                if idx == 0 {
                    return Ok(None);
                }
                let key = view.key_at(idx - 1)?.to_vec();
                let (stored, _) = view.raw_value_at(idx - 1)?;
                return Ok(Some((current, key, stored.to_vec())));
            }
            let start = match bound {
                None => view.entry_count().saturating_sub(1),
                Some(bound) => view.choose_child(bound)?.0,
            };
            let children: Vec<PageId> = (0..=start)
                .rev()
                .map(|idx| view.child_at(idx))
                .collect::<Result<_>>()?;
            drop(page);
            for child in children {
                if let Some(found) = self.find_le_in(child, bound)? {
                    return Ok(Some(found));
                }
            }
            return Ok(None);
        }
    }

    /// Point lookup: the value of the first entry with `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let target = Target::key_min(key);
        let mut page = self.descend_read(&target)?;
        loop {
            let view = PageView::parse(page.guard.data())?;
            let idx = view.lower_bound(key)?;
            if idx < view.entry_count() && view.key_at(idx)? == key {
                let value = self.materialize(&view, idx)?;
                return Ok(Some(value));
            }
            if view.covers(&Target::key_max(key))? {
                return Ok(None);
            }
            let Some(next) = view.right_sibling() else {
                return Ok(None);
            };
            drop(page);
            page = self.read_latched(next)?;
        }
    }

    /// Resolves a leaf value, reading overflow chains when necessary.
    pub(crate) fn materialize(&self, view: &PageView<'_>, idx: usize) -> Result<Vec<u8>> {
        match view.value_at(idx)? {
            page::LeafValue::Inline(bytes) => Ok(bytes.to_vec()),
            page::LeafValue::Overflow { head, total } => self.read_overflow(head, total),
        }
    }

    pub(crate) fn read_latched(&self, page_id: PageId) -> Result<ReadPage> {
        let handle = self.pool.fix(page_id)?;
        self.heal_if_unsafe(&handle)?;
        let guard = handle.shared_owned();
        Ok(ReadPage { guard, handle })
    }

    fn heal_if_unsafe(&self, handle: &PageHandle) -> Result<()> {
        let unsafe_now = !handle.shared().safe;
        if unsafe_now {
            let mut guard = handle.exclusive();
            PageView::parse(guard.data())?;
            guard.safe = true;
        }
        Ok(())
    }

    /// Shared-latched descent to the leaf covering `target`.
    pub(crate) fn descend_read(&self, target: &Target<'_>) -> Result<ReadPage> {
        let mut current = self.root;
        loop {
            let handle = match self.pool.fix(current) {
                Ok(handle) => handle,
                Err(StoreError::Buffer(BufferError::PageNotFound(_))) if current != self.root => {
                    // The page went away under us; retry from the top.
                    current = self.root;
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.heal_if_unsafe(&handle)?;
            let guard = handle.shared_owned();
            let view = PageView::parse(guard.data())?;
            if !view.covers(target)? {
                let Some(next) = view.right_sibling() else {
                    return Err(IndexError::StructuralCorruption(
                        "high key set without right sibling",
                    )
                    .into());
                };
                current = next;
                continue;
            }
            if view.is_leaf() {
                return Ok(ReadPage { guard, handle });
            }
            let (_, child) = view.choose_child(target)?;
            current = child;
        }
    }

    /// Exclusive-latched descent to the leaf covering `target`, returning
    /// the branch pages visited for later separator posting.
    fn descend_write(&self, target: &Target<'_>) -> Result<(WritePage, BranchPath)> {
        'restart: loop {
            let mut path: BranchPath = SmallVec::new();
            let mut current = self.root;
            loop {
                let handle = match self.pool.fix(current) {
                    Ok(handle) => handle,
                    Err(StoreError::Buffer(BufferError::PageNotFound(_)))
                        if current != self.root =>
                    {
                        continue 'restart;
                    }
                    Err(err) => return Err(err),
                };
                self.heal_if_unsafe(&handle)?;
                let guard = handle.shared_owned();
                let view = PageView::parse(guard.data())?;
                if !view.covers(target)? {
                    let Some(next) = view.right_sibling() else {
                        return Err(IndexError::StructuralCorruption(
                            "high key set without right sibling",
                        )
                        .into());
                    };
                    current = next;
                    continue;
                }
                if view.is_leaf() {
                    drop(guard);
                    let wguard = handle.exclusive_owned();
                    let view = PageView::parse(wguard.data())?;
                    if !view.is_leaf() {
                        // The root grew into a branch between our latches.
                        continue;
                    }
                    if !view.covers(target)? {
                        let Some(next) = view.right_sibling() else {
                            return Err(IndexError::StructuralCorruption(
                                "high key set without right sibling",
                            )
                            .into());
                        };
                        current = next;
                        continue;
                    }
                    return Ok((WritePage { guard: wguard, handle }, path));
                }
                let (_, child) = view.choose_child(target)?;
                path.push(current);
                current = child;
            }
        }
    }

    /// Inserts an entry in stored form. `resume` switches logging to a
    /// compensation record during undo of a delete.
    pub(crate) fn insert_stored(
        &self,
        tx: &Transaction,
        key: &[u8],
        stored: &[u8],
        vflags: u8,
        resume: Option<Lsn>,
    ) -> Result<()> {
        let target = Target::exact(key, stored);
        loop {
            let (mut leaf, path) = self.descend_write(&target)?;
            let page_id = leaf.handle.page_id();
            let (idx, fits) = {
                let view = PageView::parse(leaf.guard.data())?;
                if self.unique {
                    let at = view.lower_bound(key)?;
                    if at < view.entry_count() && view.key_at(at)? == key {
                        return Err(IndexError::DuplicateKey.into());
                    }
                }
                let idx = match view.leaf_position(&target)? {
                    Ok(_) => return Err(IndexError::DuplicateKey.into()),
                    Err(idx) => idx,
                };
                let needed = page::leaf_record_len(key.len(), stored.len()) + 2;
                let fits = view.free_space() >= needed
                    || view.live_space() + needed <= view.capacity();
                (idx, fits)
            };
            if fits {
                let body = match resume {
                    None => LogRecordBody::InsertEntry {
                        root: self.root,
                        page: page_id,
                        key: key.to_vec(),
                        value: stored.to_vec(),
                        vflags,
                    },
                    Some(undo_next) => LogRecordBody::CompensateDelete {
                        root: self.root,
                        page: page_id,
                        key: key.to_vec(),
                        value: stored.to_vec(),
                        vflags,
                        undo_next,
                    },
                };
                let lsn = self.mgr.log_update(tx, body)?;
                {
                    let mut page = PageMut::new(leaf.guard.data_mut());
                    page.insert_leaf(idx, key, stored, vflags)?;
                }
                leaf.guard.mark_dirty(lsn);
                return Ok(());
            }
            self.split(tx, leaf, path)?;
        }
    }

    /// Finds and removes the first entry with `key` whose value matches;
    /// returns its stored bytes and flags. `resume` switches logging to a
    /// compensation record during undo of an insert.
    fn delete_matching(
        &self,
        tx: &Transaction,
        key: &[u8],
        value: &[u8],
        matching: ValueMatch,
        resume: Option<Lsn>,
    ) -> Result<(Vec<u8>, u8)> {
        let start = Target::key_min(key);
        let (mut leaf, _) = self.descend_write(&start)?;
        loop {
            let page_id = leaf.handle.page_id();
            let mut found = None;
            let mut move_right = false;
            {
                let view = PageView::parse(leaf.guard.data())?;
                let mut idx = view.lower_bound(key)?;
                while idx < view.entry_count() && view.key_at(idx)? == key {
                    let (stored, vflags) = view.raw_value_at(idx)?;
                    let matched = match matching {
                        ValueMatch::Stored => stored == value,
                        ValueMatch::Semantic => {
                            if vflags & VFLAG_OVERFLOW != 0 {
                                let (head, total) = decode_overflow_ref(stored)?;
                                total as usize == value.len()
                                    && self.read_overflow(head, total)? == value
                            } else {
                                stored == value
                            }
                        }
                    };
                    if matched {
                        found = Some((idx, stored.to_vec(), vflags));
                        break;
                    }
                    idx += 1;
                }
                if found.is_none()
                    && idx == view.entry_count()
                    && !view.covers(&Target::key_max(key))?
                {
                    move_right = true;
                }
            }
            if let Some((idx, stored, vflags)) = found {
                let body = match resume {
                    None => LogRecordBody::DeleteEntry {
                        root: self.root,
                        page: page_id,
                        key: key.to_vec(),
                        value: stored.clone(),
                        vflags,
                    },
                    Some(undo_next) => LogRecordBody::CompensateInsert {
                        root: self.root,
                        page: page_id,
                        key: key.to_vec(),
                        value: stored.clone(),
                        vflags,
                        undo_next,
                    },
                };
                let lsn = self.mgr.log_update(tx, body)?;
                {
                    let mut page = PageMut::new(leaf.guard.data_mut());
                    page.remove(idx)?;
                }
                leaf.guard.mark_dirty(lsn);
                return Ok((stored, vflags));
            }
            if !move_right {
                return Err(IndexError::EntryNotFound.into());
            }
            let next = {
                let view = PageView::parse(leaf.guard.data())?;
                view.right_sibling().ok_or(IndexError::StructuralCorruption(
                    "high key set without right sibling",
                ))?
            };
            // Latch order within a level is strictly left to right.
            let next_handle = self.pool.fix(next)?;
            self.heal_if_unsafe(&next_handle)?;
            let next_guard = next_handle.exclusive_owned();
            leaf = WritePage {
                guard: next_guard,
                handle: next_handle,
            };
        }
    }

    /// Undo helper: removes the exact stored pair, logging a compensation.
    pub(crate) fn delete_stored_for_undo(
        &self,
        tx: &Transaction,
        key: &[u8],
        stored: &[u8],
        resume: Lsn,
    ) -> Result<()> {
        self.delete_matching(tx, key, stored, ValueMatch::Stored, Some(resume))
            .map(|_| ())
    }

    fn externalize_value(&self, tx: &Transaction, value: &[u8]) -> Result<(Vec<u8>, u8)> {
        if value.len() <= self.max_inline_value() {
            return Ok((value.to_vec(), 0));
        }
        let cap = overflow::capacity(self.block_size());
        let chunks: Vec<&[u8]> = value.chunks(cap).collect();
        let mut next = PageId::NONE;
        for chunk in chunks.iter().rev() {
            let handle = self.allocate_page(tx)?;
            let page_id = handle.page_id();
            let lsn = self.mgr.log_update(
                tx,
                LogRecordBody::OverflowPage {
                    root: self.root,
                    page: page_id,
                    next,
                    bytes: chunk.to_vec(),
                },
            )?;
            {
                let mut guard = handle.exclusive_owned();
                overflow::format(
                    guard.data_mut(),
                    (!next.is_none()).then_some(next),
                    chunk,
                )?;
                guard.mark_dirty(lsn);
            }
            next = page_id;
        }
        debug!(head = %next, len = value.len(), "externalized value");
        Ok((
            encode_overflow_ref(next, value.len() as u32).to_vec(),
            VFLAG_OVERFLOW,
        ))
    }

    fn read_overflow(&self, head: PageId, total: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total as usize);
        let mut cursor = Some(head);
        while let Some(page_id) = cursor {
            let handle = self.pool.fix(page_id)?;
            let guard = handle.shared_owned();
            out.extend_from_slice(overflow::payload(guard.data())?);
            cursor = overflow::next(guard.data());
        }
        if out.len() != total as usize {
            return Err(IndexError::StructuralCorruption("overflow chain length mismatch").into());
        }
        Ok(out)
    }

    fn overflow_chain(&self, head: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut cursor = Some(head);
        while let Some(page_id) = cursor {
            let handle = self.pool.fix(page_id)?;
            let guard = handle.shared_owned();
            overflow::payload(guard.data())?;
            pages.push(page_id);
            cursor = overflow::next(guard.data());
        }
        Ok(pages)
    }

    fn allocate_page(&self, tx: &Transaction) -> Result<PageHandle> {
        let handle = self.pool.allocate(self.unit, None, Some(tx.id()))?;
        self.mgr.log_update(
            tx,
            LogRecordBody::AllocPage {
                page: handle.page_id(),
                unit: self.unit,
            },
        )?;
        Ok(handle)
    }

    /// Splits a full page. The split itself is one nested top action; the
    /// separator is then posted to the parent as an independent step, which
    /// a crash may omit without breaking the tree.
    fn split(&self, tx: &Transaction, mut full: WritePage, path: BranchPath) -> Result<()> {
        let page_id = full.handle.page_id();
        if page_id == self.root {
            return self.grow_root(tx, full);
        }
        let anchor = tx.last_lsn();
        let right_handle = self.allocate_page(tx)?;
        let right_id = right_handle.page_id();
        let (left_image, right_image, separator) =
            build_split_images(full.guard.data(), page_id, right_id)?;
        let level = PageView::parse(full.guard.data())?.level();
        let lsn = self.mgr.log_update(
            tx,
            LogRecordBody::SplitPage {
                root: self.root,
                left: page_id,
                right: right_id,
                separator: separator.clone(),
                left_image: left_image.clone(),
                right_image: right_image.clone(),
            },
        )?;
        {
            let mut right_guard = right_handle.exclusive_owned();
            right_guard.data_mut().copy_from_slice(&right_image);
            right_guard.mark_dirty(lsn);
        }
        full.guard.data_mut().copy_from_slice(&left_image);
        full.guard.mark_dirty(lsn);
        self.mgr
            .log_update(tx, LogRecordBody::SmoDone { undo_next: anchor })?;
        debug!(left = %page_id, right = %right_id, "split page");
        drop(full);
        self.post_separator(tx, path, separator, right_id, level + 1)
    }

    /// Root split with a stable root id: the old root's content moves to a
    /// fresh left page and the root is rewritten as a two-child branch.
    fn grow_root(&self, tx: &Transaction, mut root_page: WritePage) -> Result<()> {
        let anchor = tx.last_lsn();
        let left_handle = self.allocate_page(tx)?;
        let right_handle = self.allocate_page(tx)?;
        let left_id = left_handle.page_id();
        let right_id = right_handle.page_id();
        let (left_image, right_image, separator) =
            build_split_images(root_page.guard.data(), left_id, right_id)?;
        let (level, flags) = {
            let view = PageView::parse(root_page.guard.data())?;
            (view.level(), view.flags() & FLAG_UNIQUE)
        };
        let mut root_image = vec![0u8; self.block_size()];
        root_image[0] = root_page.guard.data()[0];
        PageMut::format(
            &mut root_image,
            self.root,
            PageKind::Branch,
            level + 1,
            flags,
            None,
            None,
        )?;
        {
            let mut branch = PageMut::new(&mut root_image);
            branch.insert_branch(0, b"", left_id)?;
            branch.insert_branch(1, &separator, right_id)?;
        }
        let lsn = self.mgr.log_update(
            tx,
            LogRecordBody::RootGrow {
                root: self.root,
                left: left_id,
                right: right_id,
                separator,
                root_image: root_image.clone(),
                left_image: left_image.clone(),
                right_image: right_image.clone(),
            },
        )?;
        {
            let mut left_guard = left_handle.exclusive_owned();
            left_guard.data_mut().copy_from_slice(&left_image);
            left_guard.mark_dirty(lsn);
        }
        {
            let mut right_guard = right_handle.exclusive_owned();
            right_guard.data_mut().copy_from_slice(&right_image);
            right_guard.mark_dirty(lsn);
        }
        root_page.guard.data_mut().copy_from_slice(&root_image);
        root_page.guard.mark_dirty(lsn);
        self.mgr
            .log_update(tx, LogRecordBody::SmoDone { undo_next: anchor })?;
        info!(root = %self.root, new_level = level + 1, "tree grew");
        Ok(())
    }

    /// Posts `(separator, child)` into the branch level above a completed
    /// split, splitting parents as needed on the way up.
    fn post_separator(
        &self,
        tx: &Transaction,
        mut path: BranchPath,
        separator: Vec<u8>,
        child: PageId,
        level: u8,
    ) -> Result<()> {
        let (skey, svalue) = bound::decode(&separator)?;
        let target = Target::exact(skey, svalue);
        let mut current = match path.pop() {
            Some(parent) => parent,
            None => self.find_level_page(&target, level)?,
        };
        loop {
            let handle = match self.pool.fix(current) {
                Ok(handle) => handle,
                Err(StoreError::Buffer(BufferError::PageNotFound(_))) => {
                    current = self.find_level_page(&target, level)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.heal_if_unsafe(&handle)?;
            let mut wguard = handle.exclusive_owned();
            let view = PageView::parse(wguard.data())?;
            if view.is_leaf() || view.level() != level {
                drop(wguard);
                current = self.find_level_page(&target, level)?;
                continue;
            }
            if !view.covers(&target)? {
                let Some(next) = view.right_sibling() else {
                    return Err(IndexError::StructuralCorruption(
                        "high key set without right sibling",
                    )
                    .into());
                };
                current = next;
                continue;
            }
            let (idx, exact) = view.branch_position(&target)?;
            if exact {
                // A previous attempt (or recovery) already posted it.
                return Ok(());
            }
            let needed = page::branch_record_len(separator.len()) + 2;
            let fits =
                view.free_space() >= needed || view.live_space() + needed <= view.capacity();
            if fits {
                let lsn = self.mgr.log_update(
                    tx,
                    LogRecordBody::PostSeparator {
                        root: self.root,
                        parent: current,
                        separator: separator.clone(),
                        child,
                    },
                )?;
                {
                    let mut page = PageMut::new(wguard.data_mut());
                    page.insert_branch(idx, &separator, child)?;
                }
                wguard.mark_dirty(lsn);
                debug!(parent = %current, child = %child, "posted separator");
                return Ok(());
            }
            let full = WritePage {
                guard: wguard,
                handle,
            };
            self.split(tx, full, path.clone())?;
            // Retry the posting against whichever half now covers it.
        }
    }

    /// Walks from the root to the page at `level` covering `target`.
    fn find_level_page(&self, target: &Target<'_>, level: u8) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let handle = match self.pool.fix(current) {
                Ok(handle) => handle,
                Err(StoreError::Buffer(BufferError::PageNotFound(_))) if current != self.root => {
                    current = self.root;
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.heal_if_unsafe(&handle)?;
            let guard = handle.shared_owned();
            let view = PageView::parse(guard.data())?;
            if !view.covers(target)? {
                let Some(next) = view.right_sibling() else {
                    return Err(IndexError::StructuralCorruption(
                        "high key set without right sibling",
                    )
                    .into());
                };
                current = next;
                continue;
            }
            if view.level() == level {
                return Ok(current);
            }
            if view.level() < level {
                return Err(IndexError::StructuralCorruption(
                    "tree shorter than expected during separator posting",
                )
                .into());
            }
            let (_, child) = view.choose_child(target)?;
            current = child;
        }
    }
}

/// Builds the post-split images of both halves plus the separator boundary.
/// Images carry a zeroed header LSN; appliers stamp the split record's LSN.
fn build_split_images(
    data: &[u8],
    left_id: PageId,
    right_id: PageId,
) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let view = PageView::parse(data)?;
    let n = view.entry_count();
    if n < 2 {
        return Err(IndexError::StructuralCorruption("split of a page with fewer than two entries").into());
    }
    let is_leaf = view.is_leaf();
    let split_at = pick_split_point(&view, data.len())?;
    // Unique trees bound by key alone; otherwise an entry whose key equals
    // the separator key could land on the wrong side of its duplicate check.
    let separator = if !is_leaf {
        view.key_at(split_at)?.to_vec()
    } else if view.unique() {
        bound::encode(view.key_at(split_at)?, b"")
    } else {
        bound::encode(view.key_at(split_at)?, view.raw_value_at(split_at)?.0)
    };
    let kind = if is_leaf {
        PageKind::Leaf
    } else {
        PageKind::Branch
    };
    let flags = view.flags() & FLAG_UNIQUE;
    let level = view.level();

    let mut left = vec![0u8; data.len()];
    let mut right = vec![0u8; data.len()];
    left[0] = data[0];
    right[0] = data[0];
    PageMut::format(
        &mut left,
        left_id,
        kind,
        level,
        flags,
        Some(&separator),
        Some(right_id),
    )?;
    PageMut::format(
        &mut right,
        right_id,
        kind,
        level,
        flags,
        view.high_key(),
        view.right_sibling(),
    )?;
    {
        let mut left_page = PageMut::new(&mut left);
        for idx in 0..split_at {
            copy_entry(&view, idx, idx, &mut left_page, is_leaf)?;
        }
    }
    {
        let mut right_page = PageMut::new(&mut right);
        for idx in split_at..n {
            copy_entry(&view, idx, idx - split_at, &mut right_page, is_leaf)?;
        }
    }
    Ok((left, right, separator))
}

/// Picks a split position balancing bytes, not counts, and verifies both
/// halves fit their post-split pages: the left half gains the separator as
/// its high key, the right half inherits the old high key.
fn pick_split_point(view: &PageView<'_>, page_len: usize) -> Result<usize> {
    let n = view.entry_count();
    let is_leaf = view.is_leaf();
    let old_high_len = view.high_key().map_or(0, <[u8]>::len);

    let mut lens = Vec::with_capacity(n);
    let mut total = 0usize;
    for idx in 0..n {
        let key_len = view.key_at(idx)?.len();
        let len = if is_leaf {
            page::leaf_record_len(key_len, view.raw_value_at(idx)?.0.len())
        } else {
            page::branch_record_len(key_len)
        };
        lens.push(len);
        total += len;
    }

    let fits = |split_at: usize, lens: &[usize]| -> Result<bool> {
        let left_bytes: usize = lens[..split_at].iter().sum();
        let sep_len = if !is_leaf {
            view.key_at(split_at)?.len()
        } else if view.unique() {
            2 + view.key_at(split_at)?.len()
        } else {
            2 + view.key_at(split_at)?.len() + view.raw_value_at(split_at)?.0.len()
        };
        let left_cap = page_len - (crate::buffer::PAGE_HDR_LEN + page::BASE_HDR_LEN + sep_len);
        let right_cap =
            page_len - (crate::buffer::PAGE_HDR_LEN + page::BASE_HDR_LEN + old_high_len);
        let right_bytes = total - left_bytes;
        Ok(left_bytes + split_at * 2 <= left_cap
            && right_bytes + (n - split_at) * 2 <= right_cap)
    };

    // Walk candidates outward from the byte midpoint.
    let mut midpoint = 1usize;
    let mut acc = 0usize;
    for (idx, len) in lens.iter().enumerate() {
        acc += len;
        if acc * 2 >= total {
            midpoint = idx.max(1).min(n - 1);
            break;
        }
    }
    for distance in 0..n {
        for candidate in [midpoint.saturating_sub(distance), midpoint + distance] {
            if candidate >= 1 && candidate <= n - 1 && fits(candidate, &lens)? {
                return Ok(candidate);
            }
        }
    }
    Err(IndexError::StructuralCorruption("no feasible split point").into())
}

fn copy_entry(
    view: &PageView<'_>,
    from: usize,
    to: usize,
    dst: &mut PageMut<'_>,
    is_leaf: bool,
) -> Result<()> {
    let key = view.key_at(from)?;
    if is_leaf {
        let (value, vflags) = view.raw_value_at(from)?;
        dst.insert_leaf(to, key, value, vflags)
    } else {
        dst.insert_branch(to, key, view.child_at(from)?)
    }
}

fn decode_overflow_ref(stored: &[u8]) -> Result<(PageId, u32)> {
    if stored.len() != page::OVERFLOW_REF_LEN {
        return Err(IndexError::StructuralCorruption("malformed overflow reference").into());
    }
    Ok((
        PageId(u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]])),
        u32::from_be_bytes([stored[4], stored[5], stored[6], stored[7]]),
    ))
}
