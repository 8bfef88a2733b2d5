//! Latch-coupled B-link tree index over buffered container pages.

pub mod cursor;
pub mod page;
mod redo;
pub mod stats;
pub mod tree;

#[cfg(test)]
mod tests;

pub use cursor::{Cursor, SearchMode};
pub use stats::{PageInfo, TreeStats};
pub use tree::BlinkTree;

pub(crate) use redo::redo_apply;

use std::sync::Arc;

use crate::tx::{Transaction, TxManager};
use crate::types::{Lsn, PageId, Result};

/// Logical undo of an entry insert: re-descends from `root` and removes the
/// exact stored pair, logging a compensation record that resumes at
/// `resume`. The pair may have moved to a different leaf since the insert.
pub(crate) fn undo_insert(
    mgr: &Arc<TxManager>,
    tx: &Transaction,
    root: PageId,
    key: &[u8],
    stored: &[u8],
    resume: Lsn,
) -> Result<()> {
    let tree = BlinkTree::open(mgr, root)?;
    tree.delete_stored_for_undo(tx, key, stored, resume)
}

/// Logical undo of an entry delete: re-inserts the stored pair, logging a
/// compensation record that resumes at `resume`.
pub(crate) fn undo_delete(
    mgr: &Arc<TxManager>,
    tx: &Transaction,
    root: PageId,
    key: &[u8],
    stored: &[u8],
    vflags: u8,
    resume: Lsn,
) -> Result<()> {
    let tree = BlinkTree::open(mgr, root)?;
    tree.insert_stored(tx, key, stored, vflags, Some(resume))
}
