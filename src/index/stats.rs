//! Tree traversal for statistics and diagnostics.

use std::io::Write;

use super::page::PageView;
use super::tree::BlinkTree;
use crate::types::{PageId, Result, StoreError};

/// Snapshot of one visited page, handed to traversal visitors.
#[derive(Clone, Debug)]
pub struct PageInfo {
    /// Page identity.
    pub page: PageId,
    /// Distance from the leaf level.
    pub level: u8,
    /// True for leaves.
    pub is_leaf: bool,
    /// Number of entries.
    pub entries: usize,
    /// Live record bytes.
    pub used_space: usize,
    /// Bytes still available.
    pub free_space: usize,
    /// High key boundary, `None` for the rightmost page of a level.
    pub high_key: Option<Vec<u8>>,
    /// Right sibling, if any.
    pub right_sibling: Option<PageId>,
}

/// Aggregate shape of a tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeStats {
    /// Number of levels, 1 for a lone root leaf.
    pub height: u32,
    /// Leaf page count.
    pub leaf_pages: u64,
    /// Branch page count.
    pub branch_pages: u64,
    /// Total leaf entries.
    pub entries: u64,
    /// Live record bytes across all pages.
    pub used_bytes: u64,
    /// Record-area capacity across all pages.
    pub capacity_bytes: u64,
}

impl BlinkTree {
    /// Visits every page level by level, leaves last, following the sibling
    /// chains. Intended for statistics and consistency checks; the walk
    /// latches one page at a time and tolerates concurrent growth.
    pub fn traverse<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&PageInfo) -> Result<()>,
    {
        let mut level_start = Some(self.root());
        while let Some(start) = level_start.take() {
            let mut current = Some(start);
            while let Some(page_id) = current {
                let page = self.read_latched(page_id)?;
                let view = PageView::parse(page.guard.data())?;
                if level_start.is_none() && !view.is_leaf() && view.entry_count() > 0 {
                    level_start = Some(view.child_at(0)?);
                }
                let info = PageInfo {
                    page: page_id,
                    level: view.level(),
                    is_leaf: view.is_leaf(),
                    entries: view.entry_count(),
                    used_space: view.used_space(),
                    free_space: view.free_space(),
                    high_key: view.high_key().map(<[u8]>::to_vec),
                    right_sibling: view.right_sibling(),
                };
                visit(&info)?;
                current = view.right_sibling();
            }
        }
        Ok(())
    }

    /// Aggregates page counts, height, and fill via [`BlinkTree::traverse`].
    pub fn stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        let capacity_base = self.pool().container().block_size();
        self.traverse(|info| {
            if info.is_leaf {
                stats.leaf_pages += 1;
                stats.entries += info.entries as u64;
            } else {
                stats.branch_pages += 1;
            }
            stats.height = stats.height.max(u32::from(info.level) + 1);
            stats.used_bytes += info.used_space as u64;
            stats.capacity_bytes += capacity_base as u64;
            Ok(())
        })?;
        Ok(stats)
    }

    /// Writes a human-readable page listing for debugging.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "index root={} unique={}", self.root(), self.unique())
            .map_err(StoreError::from)?;
        self.traverse(|info| {
            writeln!(
                out,
                "  level={} page={} kind={} entries={} used={} free={} high_key={} sibling={}",
                info.level,
                info.page,
                if info.is_leaf { "leaf" } else { "branch" },
                info.entries,
                info.used_space,
                info.free_space,
                info.high_key
                    .as_ref()
                    .map(|high| format!("{} bytes", high.len()))
                    .unwrap_or_else(|| "inf".to_string()),
                info.right_sibling
                    .map(|page| page.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )
            .map_err(StoreError::from)?;
            Ok(())
        })
    }
}
