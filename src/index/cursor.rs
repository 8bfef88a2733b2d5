//! Range cursors over the leaf level.
//!
//! A cursor never holds a latch between `next` calls. It remembers the leaf
//! it stopped in and the position of the entry it last returned; on resume
//! it re-searches that position inside the leaf, which tolerates concurrent
//! inserts, deletes, and splits (entries only ever move right along the
//! sibling chain). A leaf that disappeared or was flagged not-safe forces a
//! fresh descent from the root.

use super::page::{PageView, Target};
use super::tree::BlinkTree;
use crate::types::{PageId, Result, StoreError};

/// Initial positioning of a cursor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Before the first entry of the index.
    First,
    /// At the last entry of the index.
    Last,
    /// At the first entry with key `>=` the search key.
    GreaterOrEqual,
    /// At the last entry with key `<=` the search key.
    LessOrEqual,
}

enum Resume {
    /// Return the first entry at or after `(key, Min)`.
    AtOrAfterKey(Vec<u8>),
    /// Return the first entry strictly after the stored pair.
    After(Vec<u8>, Vec<u8>),
    /// Return exactly this already-located pair, then continue after it.
    Pending(PageId, Vec<u8>, Vec<u8>),
    Exhausted,
}

/// Forward iterator over index entries, yielding `(key, value)` with values
/// materialized from overflow chains.
pub struct Cursor<'t> {
    tree: &'t BlinkTree,
    leaf: PageId,
    resume: Resume,
    max_key: Option<Vec<u8>>,
}

impl<'t> Cursor<'t> {
    pub(crate) fn open(
        tree: &'t BlinkTree,
        mode: SearchMode,
        key: Option<&[u8]>,
        max_key: Option<&[u8]>,
    ) -> Result<Cursor<'t>> {
        let max_key = max_key.map(<[u8]>::to_vec);
        let (leaf, resume) = match mode {
            SearchMode::First => {
                let page = tree.descend_read(&Target::key_min(b""))?;
                (page.handle.page_id(), Resume::AtOrAfterKey(Vec::new()))
            }
            SearchMode::GreaterOrEqual => {
                let key = key.ok_or(StoreError::Invalid("search mode requires a key"))?;
                let page = tree.descend_read(&Target::key_min(key))?;
                (page.handle.page_id(), Resume::AtOrAfterKey(key.to_vec()))
            }
            SearchMode::Last => match tree.find_less_or_equal(None)? {
                Some((leaf, key, stored)) => (leaf, Resume::Pending(leaf, key, stored)),
                None => (tree.root(), Resume::Exhausted),
            },
            SearchMode::LessOrEqual => {
                let key = key.ok_or(StoreError::Invalid("search mode requires a key"))?;
                match tree.find_less_or_equal(Some(&Target::key_max(key)))? {
                    Some((leaf, key, stored)) => (leaf, Resume::Pending(leaf, key, stored)),
                    None => (tree.root(), Resume::Exhausted),
                }
            }
        };
        Ok(Cursor {
            tree,
            leaf,
            resume,
            max_key,
        })
    }

    /// Advances to the next entry, or `None` when the range is exhausted.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            match std::mem::replace(&mut self.resume, Resume::Exhausted) {
                Resume::Exhausted => return Ok(None),
                Resume::Pending(leaf, key, stored) => {
                    self.leaf = leaf;
                    if self.past_max(&key) {
                        return Ok(None);
                    }
                    match self.materialize_pair(leaf, &key, &stored)? {
                        Some(value) => {
                            self.resume = Resume::After(key.clone(), stored);
                            return Ok(Some((key, value)));
                        }
                        None => {
                            // The anchored entry was deleted concurrently;
                            // fall through to its successor.
                            self.resume = Resume::After(key, stored);
                            continue;
                        }
                    }
                }
                Resume::AtOrAfterKey(key) => {
                    let target = Target::key_min(&key);
                    match self.step(&target)? {
                        Some(found) => return Ok(Some(found)),
                        None => return Ok(None),
                    }
                }
                Resume::After(key, stored) => {
                    let target = Target::exact(&key, &stored);
                    match self.step_after(&target)? {
                        Some(found) => return Ok(Some(found)),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Positions at the first entry `>= target` and returns it.
    fn step(&mut self, target: &Target<'_>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.advance(target, false)
    }

    /// Positions at the first entry `> target` and returns it.
    fn step_after(&mut self, target: &Target<'_>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.advance(target, true)
    }

    fn advance(
        &mut self,
        target: &Target<'_>,
        strictly_after: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut current = self.leaf;
        loop {
            let page = match self.tree.read_latched(current) {
                Ok(page) => page,
                Err(StoreError::Buffer(_)) => {
                    // The cached leaf is gone; re-descend from the root.
                    let page = self.tree.descend_read(target)?;
                    let id = page.handle.page_id();
                    drop(page);
                    current = id;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let view = PageView::parse(page.guard.data())?;
            if !view.is_leaf() {
                drop(page);
                let descended = self.tree.descend_read(target)?;
                current = descended.handle.page_id();
                continue;
            }
            let idx = match view.leaf_position(target)? {
                Ok(found) => {
                    if strictly_after {
                        found + 1
                    } else {
                        found
                    }
                }
                Err(insert_at) => insert_at,
            };
            if idx < view.entry_count() {
                let key = view.key_at(idx)?.to_vec();
                if self.past_max(&key) {
                    self.resume = Resume::Exhausted;
                    return Ok(None);
                }
                let (stored, _) = view.raw_value_at(idx)?;
                let stored = stored.to_vec();
                let value = self.tree.materialize(&view, idx)?;
                drop(page);
                self.leaf = current;
                self.resume = Resume::After(key.clone(), stored);
                return Ok(Some((key, value)));
            }
            match view.right_sibling() {
                Some(next) => {
                    drop(page);
                    current = next;
                }
                None => {
                    self.resume = Resume::Exhausted;
                    return Ok(None);
                }
            }
        }
    }

    fn materialize_pair(&self, leaf: PageId, key: &[u8], stored: &[u8]) -> Result<Option<Vec<u8>>> {
        // Re-read through the leaf so overflow chains resolve consistently.
        if let Ok(page) = self.tree.read_latched(leaf) {
            let view = PageView::parse(page.guard.data())?;
            if view.is_leaf() {
                if let Ok(idx) = view.leaf_position(&Target::exact(key, stored))? {
                    return self.tree.materialize(&view, idx).map(Some);
                }
            }
        }
        // Entry moved; find it again from the root.
        let page = self.tree.descend_read(&Target::exact(key, stored))?;
        let view = PageView::parse(page.guard.data())?;
        match view.leaf_position(&Target::exact(key, stored))? {
            Ok(idx) => self.tree.materialize(&view, idx).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn past_max(&self, key: &[u8]) -> bool {
        match &self.max_key {
            Some(max) => key > max.as_slice(),
            None => false,
        }
    }
}
