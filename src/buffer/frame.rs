//! In-memory frame holding one buffered page.

use crate::types::codec;
use crate::types::{Lsn, PageId, TxId, UnitId};

/// Length of the fixed page header present on every page: unit id, page
/// kind, and the embedded 8-byte LSN.
pub const PAGE_HDR_LEN: usize = 16;

const HDR_UNIT_OFF: usize = 0;
const HDR_KIND_OFF: usize = 1;
const HDR_LSN_OFF: usize = 4;

/// One buffer slot's contents: the page image plus its bookkeeping fields.
/// Mutated only while the owning slot's latch is held.
pub struct Frame {
    data: Box<[u8]>,
    /// Identity of the resident page, `PageId::NONE` for an empty slot.
    pub page_id: PageId,
    /// Unit the resident page belongs to.
    pub unit: UnitId,
    /// LSN of the last change applied to the page, mirrored in the header.
    pub lsn: Lsn,
    /// LSN of the earliest change not yet on disk, `None` when clean.
    pub redo_lsn: Option<Lsn>,
    /// True once the in-memory image diverged from the on-disk one.
    pub modified: bool,
    /// Cleared when activity (recovery redo, reuse) may have invalidated
    /// positions cached by cursors; forces a re-descent.
    pub safe: bool,
    /// Transaction that allocated the page, until it completes.
    pub assigned_to: Option<TxId>,
}

impl Frame {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size].into_boxed_slice(),
            page_id: PageId::NONE,
            unit: 0,
            lsn: Lsn(0),
            redo_lsn: None,
            modified: false,
            safe: true,
            assigned_to: None,
        }
    }

    /// Read access to the page image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the page image. Callers must follow with
    /// [`Frame::mark_dirty`] carrying the log record's LSN.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Records a logged mutation: flags the frame dirty, pins `redo_lsn` to
    /// the first unflushed change, and stamps the LSN into the page header.
    pub fn mark_dirty(&mut self, lsn: Lsn) {
        self.modified = true;
        if self.redo_lsn.is_none() {
            self.redo_lsn = Some(lsn);
        }
        self.lsn = lsn;
        codec::put_lsn(&mut self.data, HDR_LSN_OFF, lsn);
    }

    /// Page kind byte from the fixed header.
    pub fn kind_byte(&self) -> u8 {
        self.data[HDR_KIND_OFF]
    }

    /// Initializes the fixed header of a freshly allocated page.
    pub fn format(&mut self, unit: UnitId, kind: u8) {
        self.data.fill(0);
        self.data[HDR_UNIT_OFF] = unit;
        self.data[HDR_KIND_OFF] = kind;
        codec::put_lsn(&mut self.data, HDR_LSN_OFF, Lsn(0));
        self.unit = unit;
        self.lsn = Lsn(0);
    }

    /// Re-derives header-mirrored fields after loading an image from disk.
    pub(crate) fn adopt_image(&mut self, page_id: PageId) {
        self.page_id = page_id;
        self.unit = self.data[HDR_UNIT_OFF];
        self.lsn = codec::get_lsn(&self.data, HDR_LSN_OFF);
        self.redo_lsn = None;
        self.modified = false;
        self.safe = true;
        self.assigned_to = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_dirty_pins_first_redo_lsn() {
        let mut frame = Frame::new(512);
        frame.mark_dirty(Lsn(10));
        frame.mark_dirty(Lsn(20));
        assert_eq!(frame.redo_lsn, Some(Lsn(10)));
        assert_eq!(frame.lsn, Lsn(20));
        assert!(frame.modified);
    }

    #[test]
    fn header_lsn_survives_adoption() {
        let mut frame = Frame::new(512);
        frame.format(3, 1);
        frame.mark_dirty(Lsn(99));
        let image = frame.data().to_vec();

        let mut reloaded = Frame::new(512);
        reloaded.data_mut().copy_from_slice(&image);
        reloaded.adopt_image(PageId::new(1, 5));
        assert_eq!(reloaded.lsn, Lsn(99));
        assert_eq!(reloaded.unit, 3);
        assert!(!reloaded.modified);
    }
}
