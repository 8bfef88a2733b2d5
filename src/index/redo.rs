//! Page-targeted redo application for index records.
//!
//! Recovery calls in here once per touched page after the page-LSN gate has
//! decided the change is missing. Every application is positional rather
//! than offset-based, so a redo onto a page whose heap layout differs (after
//! compaction) still lands correctly.

use super::page::{bound, overflow, PageKind, PageMut, PageView, Target};
use crate::buffer::Frame;
use crate::types::{PageId, Result};
use crate::wal::LogRecordBody;

pub(crate) fn redo_apply(body: &LogRecordBody, target: PageId, frame: &mut Frame) -> Result<()> {
    use LogRecordBody::*;
    match body {
        FormatPage {
            page, kind, flags, ..
        } => {
            debug_assert_eq!(*page, target);
            PageMut::format(
                frame.data_mut(),
                *page,
                PageKind::from_u8(*kind)?,
                0,
                *flags,
                None,
                None,
            )?;
        }
        OverflowPage { next, bytes, .. } => {
            overflow::format(
                frame.data_mut(),
                (!next.is_none()).then_some(*next),
                bytes,
            )?;
        }
        InsertEntry {
            key, value, vflags, ..
        }
        | CompensateDelete {
            key, value, vflags, ..
        } => {
            let idx = {
                let view = PageView::parse(frame.data())?;
                match view.leaf_position(&Target::exact(key, value))? {
                    Ok(_) => return Ok(()),
                    Err(idx) => idx,
                }
            };
            PageMut::new(frame.data_mut()).insert_leaf(idx, key, value, *vflags)?;
        }
        DeleteEntry { key, value, .. } | CompensateInsert { key, value, .. } => {
            let idx = {
                let view = PageView::parse(frame.data())?;
                match view.leaf_position(&Target::exact(key, value))? {
                    Ok(idx) => idx,
                    Err(_) => return Ok(()),
                }
            };
            PageMut::new(frame.data_mut()).remove(idx)?;
        }
        SplitPage {
            left,
            right,
            left_image,
            right_image,
            ..
        } => {
            let image = if target == *left {
                left_image
            } else if target == *right {
                right_image
            } else {
                return Ok(());
            };
            frame.data_mut().copy_from_slice(image);
        }
        RootGrow {
            root,
            left,
            right,
            root_image,
            left_image,
            right_image,
            ..
        } => {
            let image = if target == *root {
                root_image
            } else if target == *left {
                left_image
            } else if target == *right {
                right_image
            } else {
                return Ok(());
            };
            frame.data_mut().copy_from_slice(image);
        }
        PostSeparator {
            separator, child, ..
        } => {
            let (skey, svalue) = bound::decode(separator)?;
            let position = Target::exact(skey, svalue);
            let (idx, exact) = {
                let view = PageView::parse(frame.data())?;
                view.branch_position(&position)?
            };
            if exact {
                return Ok(());
            }
            PageMut::new(frame.data_mut()).insert_branch(idx, separator, *child)?;
        }
        _ => {}
    }
    Ok(())
}
