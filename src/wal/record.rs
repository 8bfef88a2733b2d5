//! Log record types and their wire encoding.
//!
//! Framing: `[len: u32][type: u8][tx: u64][prev_lsn: u64][payload][crc: u32]`
//! where `len` counts the bytes from the type tag through the payload and the
//! CRC covers the same span. A record's LSN is the logical stream offset of
//! its length field; it is never stored inside the record.

use smallvec::SmallVec;

use crate::types::codec;
use crate::types::{crc32, ContainerNo, LogError, Lsn, PageId, Result, TxId, UnitId};

/// Fixed bytes surrounding every payload: length prefix, type tag, tx id,
/// prev LSN, and trailing CRC.
pub const RECORD_ENVELOPE_LEN: usize = 4 + 1 + 8 + 8 + 4;

const TAG_BEGIN: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_ABORT: u8 = 3;
const TAG_END: u8 = 4;
const TAG_CHECKPOINT: u8 = 5;
const TAG_CREATE_UNIT: u8 = 6;
const TAG_DROP_UNIT: u8 = 7;
const TAG_ALLOC_PAGE: u8 = 8;
const TAG_FREE_PAGE: u8 = 9;
const TAG_FORMAT_PAGE: u8 = 10;
const TAG_INSERT_ENTRY: u8 = 11;
const TAG_DELETE_ENTRY: u8 = 12;
const TAG_COMPENSATE_INSERT: u8 = 13;
const TAG_COMPENSATE_DELETE: u8 = 14;
const TAG_COMPENSATE_ALLOC: u8 = 15;
const TAG_SPLIT_PAGE: u8 = 16;
const TAG_ROOT_GROW: u8 = 17;
const TAG_POST_SEPARATOR: u8 = 18;
const TAG_SMO_DONE: u8 = 19;
const TAG_COMPENSATE_UNIT: u8 = 20;
const TAG_OVERFLOW_PAGE: u8 = 21;

const DEFERRED_FREE_PAGE: u8 = 1;
const DEFERRED_DROP_UNIT: u8 = 2;

/// A deallocation a transaction postponed to its commit point, so that undo
/// of earlier records can still reach the affected pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeferredAction {
    /// Free one page.
    FreePage {
        /// Page to free.
        page: PageId,
        /// Unit it belongs to.
        unit: UnitId,
    },
    /// Drop a whole unit with all its pages.
    DropUnit {
        /// Owning container.
        container: ContainerNo,
        /// Unit to drop.
        unit: UnitId,
    },
}

/// An active-transaction entry inside a checkpoint record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActiveTxEntry {
    /// Transaction id.
    pub tx: TxId,
    /// Its most recent log record.
    pub last_lsn: Lsn,
    /// Next record to undo if it rolls back.
    pub undo_next: Lsn,
}

/// A dirty-page entry inside a checkpoint record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirtyPageEntry {
    /// Page identity.
    pub page: PageId,
    /// Earliest LSN not yet reflected on disk for this page.
    pub redo_lsn: Lsn,
}

/// The operation a log record describes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecordBody {
    /// Transaction start.
    Begin,
    /// Transaction commit point; durable once this record is flushed. The
    /// deferred deallocations are carried here so recovery can finish them
    /// if the crash hits between commit and completion.
    Commit {
        /// Deallocations to apply after the commit record is durable.
        deferred: Vec<DeferredAction>,
    },
    /// Transaction rollback completed.
    Abort,
    /// Transaction fully finished; it will never appear again.
    End,
    /// Fuzzy checkpoint: active transactions and dirty pages at the time.
    Checkpoint {
        /// Transactions active when the checkpoint was taken.
        active: Vec<ActiveTxEntry>,
        /// Dirty pages and their redo LSNs.
        dirty: Vec<DirtyPageEntry>,
    },
    /// A logical unit came into existence.
    CreateUnit {
        /// Owning container.
        container: ContainerNo,
        /// New unit id.
        unit: UnitId,
    },
    /// A logical unit and all its blocks were released.
    DropUnit {
        /// Owning container.
        container: ContainerNo,
        /// Dropped unit id.
        unit: UnitId,
    },
    /// A block was allocated to a unit.
    AllocPage {
        /// The allocated page.
        page: PageId,
        /// Unit it belongs to.
        unit: UnitId,
    },
    /// A block was returned to the free pool.
    FreePage {
        /// The freed page.
        page: PageId,
        /// Unit it belonged to.
        unit: UnitId,
    },
    /// A freshly allocated page was formatted with a kind byte.
    FormatPage {
        /// Index root the page belongs to.
        root: PageId,
        /// The formatted page.
        page: PageId,
        /// Unit it belongs to.
        unit: UnitId,
        /// Page kind byte written into the fixed header.
        kind: u8,
        /// Base-header flags, e.g. the unique-index bit.
        flags: u8,
    },
    /// An entry was inserted into a leaf. Redo is page-targeted; undo
    /// re-descends from `root` and removes the pair.
    InsertEntry {
        /// Index root, for logical undo.
        root: PageId,
        /// Leaf the entry landed in.
        page: PageId,
        /// Entry key.
        key: Vec<u8>,
        /// Entry value in stored form.
        value: Vec<u8>,
        /// Stored value flags, e.g. the overflow bit.
        vflags: u8,
    },
    /// An entry was removed from a leaf. Undo re-inserts the pair.
    DeleteEntry {
        /// Index root, for logical undo.
        root: PageId,
        /// Leaf the entry was removed from.
        page: PageId,
        /// Entry key.
        key: Vec<u8>,
        /// Entry value in stored form, kept for undo.
        value: Vec<u8>,
        /// Stored value flags, e.g. the overflow bit.
        vflags: u8,
    },
    /// Compensation for an insert: the pair was removed during rollback.
    CompensateInsert {
        /// Index root.
        root: PageId,
        /// Leaf the compensating delete hit.
        page: PageId,
        /// Entry key.
        key: Vec<u8>,
        /// Entry value in stored form.
        value: Vec<u8>,
        /// Stored value flags, e.g. the overflow bit.
        vflags: u8,
        /// Where undo resumes after this compensation.
        undo_next: Lsn,
    },
    /// Compensation for a delete: the pair was re-inserted during rollback.
    CompensateDelete {
        /// Index root.
        root: PageId,
        /// Leaf the compensating insert hit.
        page: PageId,
        /// Entry key.
        key: Vec<u8>,
        /// Entry value in stored form.
        value: Vec<u8>,
        /// Stored value flags, e.g. the overflow bit.
        vflags: u8,
        /// Where undo resumes after this compensation.
        undo_next: Lsn,
    },
    /// Compensation for a page allocation: the block was freed.
    CompensateAlloc {
        /// The freed page.
        page: PageId,
        /// Unit it belonged to.
        unit: UnitId,
        /// Where undo resumes after this compensation.
        undo_next: Lsn,
    },
    /// Compensation for a unit creation: the unit was dropped.
    CompensateUnit {
        /// Owning container.
        container: ContainerNo,
        /// Dropped unit id.
        unit: UnitId,
        /// Where undo resumes after this compensation.
        undo_next: Lsn,
    },
    /// One page of an externalized value was written. Redo-only; the chain
    /// pages are reclaimed through their allocation records.
    OverflowPage {
        /// Index root.
        root: PageId,
        /// The overflow page.
        page: PageId,
        /// Next page of the chain, `PageId::NONE` at the tail.
        next: PageId,
        /// Payload slice stored in this page.
        bytes: Vec<u8>,
    },
    /// A page split: `left` kept the low half, `right` is new. The images
    /// are complete page contents with a zeroed header LSN; redo stamps the
    /// record's own LSN.
    SplitPage {
        /// Index root.
        root: PageId,
        /// Page that split.
        left: PageId,
        /// Newly allocated right sibling.
        right: PageId,
        /// Separator key posted to the parent afterwards.
        separator: Vec<u8>,
        /// Post-split image of `left`.
        left_image: Vec<u8>,
        /// Post-split image of `right`.
        right_image: Vec<u8>,
    },
    /// The root split in place: its old content moved to `left`, `right` is
    /// the new sibling, and the root became a two-child branch.
    RootGrow {
        /// Index root (id unchanged).
        root: PageId,
        /// Page that received the old root content.
        left: PageId,
        /// Newly allocated right sibling.
        right: PageId,
        /// Separator between `left` and `right`.
        separator: Vec<u8>,
        /// New image of the root.
        root_image: Vec<u8>,
        /// Image of `left`.
        left_image: Vec<u8>,
        /// Image of `right`.
        right_image: Vec<u8>,
    },
    /// A separator for a completed split was posted into a branch page.
    PostSeparator {
        /// Index root.
        root: PageId,
        /// Branch page that received the separator.
        parent: PageId,
        /// Separator key.
        separator: Vec<u8>,
        /// Child the separator points at.
        child: PageId,
    },
    /// Closes a structural modification as a nested top action: undo skips
    /// everything back to `undo_next`.
    SmoDone {
        /// Where undo resumes, bypassing the structural records.
        undo_next: Lsn,
    },
}

/// One log record as appended and recovered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Issuing transaction.
    pub tx: TxId,
    /// Previous record of the same transaction, `Lsn(0)` for the first.
    pub prev_lsn: Lsn,
    /// Operation payload.
    pub body: LogRecordBody,
}

impl LogRecord {
    /// Pages whose on-disk state this record changes; drives the dirty-page
    /// table during analysis and the page-LSN gate during redo.
    pub fn touched_pages(&self) -> SmallVec<[PageId; 3]> {
        use LogRecordBody::*;
        match &self.body {
            FormatPage { page, .. }
            | OverflowPage { page, .. }
            | InsertEntry { page, .. }
            | DeleteEntry { page, .. }
            | CompensateInsert { page, .. }
            | CompensateDelete { page, .. } => SmallVec::from_slice(&[*page]),
            SplitPage { left, right, .. } => SmallVec::from_slice(&[*left, *right]),
            RootGrow {
                root, left, right, ..
            } => SmallVec::from_slice(&[*root, *left, *right]),
            PostSeparator { parent, .. } => SmallVec::from_slice(&[*parent]),
            _ => SmallVec::new(),
        }
    }

    /// For compensation records, where undo continues afterwards.
    pub fn undo_next(&self) -> Option<Lsn> {
        use LogRecordBody::*;
        match &self.body {
            CompensateInsert { undo_next, .. }
            | CompensateDelete { undo_next, .. }
            | CompensateAlloc { undo_next, .. }
            | CompensateUnit { undo_next, .. }
            | SmoDone { undo_next } => Some(*undo_next),
            _ => None,
        }
    }

    /// Serializes the record with framing and CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32);
        let tag = encode_body(&self.body, &mut payload);

        let inner_len = 1 + 8 + 8 + payload.len();
        let mut out = Vec::with_capacity(4 + inner_len + 4);
        out.extend_from_slice(&(inner_len as u32).to_be_bytes());
        out.push(tag);
        out.extend_from_slice(&self.tx.0.to_be_bytes());
        out.extend_from_slice(&self.prev_lsn.0.to_be_bytes());
        out.extend_from_slice(&payload);
        let crc = crc32(&out[4..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Decodes one framed record from the start of `buf`. Returns the record
    /// and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(LogRecord, usize)> {
        if buf.len() < 4 {
            return Err(LogError::MalformedRecord("record length prefix truncated").into());
        }
        let inner_len = codec::get_u32(buf, 0) as usize;
        if inner_len < 17 {
            return Err(LogError::MalformedRecord("record shorter than envelope").into());
        }
        let total = 4 + inner_len + 4;
        if buf.len() < total {
            return Err(LogError::MalformedRecord("record body truncated").into());
        }
        let stored_crc = codec::get_u32(buf, 4 + inner_len);
        if crc32(&buf[4..4 + inner_len]) != stored_crc {
            return Err(LogError::MalformedRecord("record crc mismatch").into());
        }
        let tag = buf[4];
        let tx = TxId(codec::get_u64(buf, 5));
        let prev_lsn = Lsn(codec::get_u64(buf, 13));
        let payload = &buf[21..4 + inner_len];
        let body = decode_body(tag, payload)?;
        Ok((
            LogRecord {
                tx,
                prev_lsn,
                body,
            },
            total,
        ))
    }
}

fn encode_body(body: &LogRecordBody, out: &mut Vec<u8>) -> u8 {
    use LogRecordBody::*;
    match body {
        Begin => TAG_BEGIN,
        Commit { deferred } => {
            out.extend_from_slice(&(deferred.len() as u32).to_be_bytes());
            for action in deferred {
                match action {
                    DeferredAction::FreePage { page, unit } => {
                        out.push(DEFERRED_FREE_PAGE);
                        out.extend_from_slice(&page.0.to_be_bytes());
                        out.push(*unit);
                    }
                    DeferredAction::DropUnit { container, unit } => {
                        out.push(DEFERRED_DROP_UNIT);
                        out.push(*container);
                        out.push(*unit);
                    }
                }
            }
            TAG_COMMIT
        }
        Abort => TAG_ABORT,
        End => TAG_END,
        Checkpoint { active, dirty } => {
            out.extend_from_slice(&(active.len() as u32).to_be_bytes());
            for entry in active {
                out.extend_from_slice(&entry.tx.0.to_be_bytes());
                out.extend_from_slice(&entry.last_lsn.0.to_be_bytes());
                out.extend_from_slice(&entry.undo_next.0.to_be_bytes());
            }
            out.extend_from_slice(&(dirty.len() as u32).to_be_bytes());
            for entry in dirty {
                out.extend_from_slice(&entry.page.0.to_be_bytes());
                out.extend_from_slice(&entry.redo_lsn.0.to_be_bytes());
            }
            TAG_CHECKPOINT
        }
        CreateUnit { container, unit } => {
            out.push(*container);
            out.push(*unit);
            TAG_CREATE_UNIT
        }
        DropUnit { container, unit } => {
            out.push(*container);
            out.push(*unit);
            TAG_DROP_UNIT
        }
        AllocPage { page, unit } => {
            out.extend_from_slice(&page.0.to_be_bytes());
            out.push(*unit);
            TAG_ALLOC_PAGE
        }
        FreePage { page, unit } => {
            out.extend_from_slice(&page.0.to_be_bytes());
            out.push(*unit);
            TAG_FREE_PAGE
        }
        FormatPage {
            root,
            page,
            unit,
            kind,
            flags,
        } => {
            out.extend_from_slice(&root.0.to_be_bytes());
            out.extend_from_slice(&page.0.to_be_bytes());
            out.push(*unit);
            out.push(*kind);
            out.push(*flags);
            TAG_FORMAT_PAGE
        }
        InsertEntry {
            root,
            page,
            key,
            value,
            vflags,
        } => {
            put_entry(out, *root, *page, key, value, *vflags);
            TAG_INSERT_ENTRY
        }
        DeleteEntry {
            root,
            page,
            key,
            value,
            vflags,
        } => {
            put_entry(out, *root, *page, key, value, *vflags);
            TAG_DELETE_ENTRY
        }
        CompensateInsert {
            root,
            page,
            key,
            value,
            vflags,
            undo_next,
        } => {
            out.extend_from_slice(&undo_next.0.to_be_bytes());
            put_entry(out, *root, *page, key, value, *vflags);
            TAG_COMPENSATE_INSERT
        }
        CompensateDelete {
            root,
            page,
            key,
            value,
            vflags,
            undo_next,
        } => {
            out.extend_from_slice(&undo_next.0.to_be_bytes());
            put_entry(out, *root, *page, key, value, *vflags);
            TAG_COMPENSATE_DELETE
        }
        CompensateAlloc {
            page,
            unit,
            undo_next,
        } => {
            out.extend_from_slice(&undo_next.0.to_be_bytes());
            out.extend_from_slice(&page.0.to_be_bytes());
            out.push(*unit);
            TAG_COMPENSATE_ALLOC
        }
        CompensateUnit {
            container,
            unit,
            undo_next,
        } => {
            out.extend_from_slice(&undo_next.0.to_be_bytes());
            out.push(*container);
            out.push(*unit);
            TAG_COMPENSATE_UNIT
        }
        OverflowPage {
            root,
            page,
            next,
            bytes,
        } => {
            out.extend_from_slice(&root.0.to_be_bytes());
            out.extend_from_slice(&page.0.to_be_bytes());
            out.extend_from_slice(&next.0.to_be_bytes());
            put_blob32(out, bytes);
            TAG_OVERFLOW_PAGE
        }
        SplitPage {
            root,
            left,
            right,
            separator,
            left_image,
            right_image,
        } => {
            out.extend_from_slice(&root.0.to_be_bytes());
            out.extend_from_slice(&left.0.to_be_bytes());
            out.extend_from_slice(&right.0.to_be_bytes());
            put_blob16(out, separator);
            put_blob32(out, left_image);
            put_blob32(out, right_image);
            TAG_SPLIT_PAGE
        }
        RootGrow {
            root,
            left,
            right,
            separator,
            root_image,
            left_image,
            right_image,
        } => {
            out.extend_from_slice(&root.0.to_be_bytes());
            out.extend_from_slice(&left.0.to_be_bytes());
            out.extend_from_slice(&right.0.to_be_bytes());
            put_blob16(out, separator);
            put_blob32(out, root_image);
            put_blob32(out, left_image);
            put_blob32(out, right_image);
            TAG_ROOT_GROW
        }
        PostSeparator {
            root,
            parent,
            separator,
            child,
        } => {
            out.extend_from_slice(&root.0.to_be_bytes());
            out.extend_from_slice(&parent.0.to_be_bytes());
            out.extend_from_slice(&child.0.to_be_bytes());
            put_blob16(out, separator);
            TAG_POST_SEPARATOR
        }
        SmoDone { undo_next } => {
            out.extend_from_slice(&undo_next.0.to_be_bytes());
            TAG_SMO_DONE
        }
    }
}

fn decode_body(tag: u8, payload: &[u8]) -> Result<LogRecordBody> {
    use LogRecordBody::*;
    let mut cur = Cursor::new(payload);
    let body = match tag {
        TAG_BEGIN => Begin,
        TAG_COMMIT => {
            let n = cur.u32()? as usize;
            let mut deferred = Vec::with_capacity(n);
            for _ in 0..n {
                let action = match cur.u8()? {
                    DEFERRED_FREE_PAGE => DeferredAction::FreePage {
                        page: PageId(cur.u32()?),
                        unit: cur.u8()?,
                    },
                    DEFERRED_DROP_UNIT => DeferredAction::DropUnit {
                        container: cur.u8()?,
                        unit: cur.u8()?,
                    },
                    _ => {
                        return Err(
                            LogError::MalformedRecord("unknown deferred action").into()
                        )
                    }
                };
                deferred.push(action);
            }
            Commit { deferred }
        }
        TAG_ABORT => Abort,
        TAG_END => End,
        TAG_CHECKPOINT => {
            let n_active = cur.u32()? as usize;
            let mut active = Vec::with_capacity(n_active);
            for _ in 0..n_active {
                active.push(ActiveTxEntry {
                    tx: TxId(cur.u64()?),
                    last_lsn: Lsn(cur.u64()?),
                    undo_next: Lsn(cur.u64()?),
                });
            }
            let n_dirty = cur.u32()? as usize;
            let mut dirty = Vec::with_capacity(n_dirty);
            for _ in 0..n_dirty {
                dirty.push(DirtyPageEntry {
                    page: PageId(cur.u32()?),
                    redo_lsn: Lsn(cur.u64()?),
                });
            }
            Checkpoint { active, dirty }
        }
        TAG_CREATE_UNIT => CreateUnit {
            container: cur.u8()?,
            unit: cur.u8()?,
        },
        TAG_DROP_UNIT => DropUnit {
            container: cur.u8()?,
            unit: cur.u8()?,
        },
        TAG_ALLOC_PAGE => AllocPage {
            page: PageId(cur.u32()?),
            unit: cur.u8()?,
        },
        TAG_FREE_PAGE => FreePage {
            page: PageId(cur.u32()?),
            unit: cur.u8()?,
        },
        TAG_FORMAT_PAGE => FormatPage {
            root: PageId(cur.u32()?),
            page: PageId(cur.u32()?),
            unit: cur.u8()?,
            kind: cur.u8()?,
            flags: cur.u8()?,
        },
        TAG_INSERT_ENTRY => {
            let (root, page, key, value, vflags) = get_entry(&mut cur)?;
            InsertEntry {
                root,
                page,
                key,
                value,
                vflags,
            }
        }
        TAG_DELETE_ENTRY => {
            let (root, page, key, value, vflags) = get_entry(&mut cur)?;
            DeleteEntry {
                root,
                page,
                key,
                value,
                vflags,
            }
        }
        TAG_COMPENSATE_INSERT => {
            let undo_next = Lsn(cur.u64()?);
            let (root, page, key, value, vflags) = get_entry(&mut cur)?;
            CompensateInsert {
                root,
                page,
                key,
                value,
                vflags,
                undo_next,
            }
        }
        TAG_COMPENSATE_DELETE => {
            let undo_next = Lsn(cur.u64()?);
            let (root, page, key, value, vflags) = get_entry(&mut cur)?;
            CompensateDelete {
                root,
                page,
                key,
                value,
                vflags,
                undo_next,
            }
        }
        TAG_COMPENSATE_ALLOC => CompensateAlloc {
            undo_next: Lsn(cur.u64()?),
            page: PageId(cur.u32()?),
            unit: cur.u8()?,
        },
        TAG_COMPENSATE_UNIT => CompensateUnit {
            undo_next: Lsn(cur.u64()?),
            container: cur.u8()?,
            unit: cur.u8()?,
        },
        TAG_OVERFLOW_PAGE => OverflowPage {
            root: PageId(cur.u32()?),
            page: PageId(cur.u32()?),
            next: PageId(cur.u32()?),
            bytes: cur.blob32()?,
        },
        TAG_SPLIT_PAGE => SplitPage {
            root: PageId(cur.u32()?),
            left: PageId(cur.u32()?),
            right: PageId(cur.u32()?),
            separator: cur.blob16()?,
            left_image: cur.blob32()?,
            right_image: cur.blob32()?,
        },
        TAG_ROOT_GROW => RootGrow {
            root: PageId(cur.u32()?),
            left: PageId(cur.u32()?),
            right: PageId(cur.u32()?),
            separator: cur.blob16()?,
            root_image: cur.blob32()?,
            left_image: cur.blob32()?,
            right_image: cur.blob32()?,
        },
        TAG_POST_SEPARATOR => PostSeparator {
            root: PageId(cur.u32()?),
            parent: PageId(cur.u32()?),
            child: PageId(cur.u32()?),
            separator: cur.blob16()?,
        },
        TAG_SMO_DONE => SmoDone {
            undo_next: Lsn(cur.u64()?),
        },
        _ => return Err(LogError::MalformedRecord("unknown record type").into()),
    };
    if !cur.at_end() {
        return Err(LogError::MalformedRecord("trailing bytes after payload").into());
    }
    Ok(body)
}

fn put_entry(out: &mut Vec<u8>, root: PageId, page: PageId, key: &[u8], value: &[u8], vflags: u8) {
    out.extend_from_slice(&root.0.to_be_bytes());
    out.extend_from_slice(&page.0.to_be_bytes());
    out.push(vflags);
    put_blob16(out, key);
    put_blob32(out, value);
}

fn get_entry(cur: &mut Cursor<'_>) -> Result<(PageId, PageId, Vec<u8>, Vec<u8>, u8)> {
    let root = PageId(cur.u32()?);
    let page = PageId(cur.u32()?);
    let vflags = cur.u8()?;
    let key = cur.blob16()?;
    let value = cur.blob32()?;
    Ok((root, page, key, value, vflags))
}

fn put_blob16(out: &mut Vec<u8>, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_blob32(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = codec::get_slice(self.buf, self.pos, n)
            .map_err(|_| LogError::MalformedRecord("payload field truncated"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(codec::get_u32(self.take(4)?, 0))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(codec::get_u64(self.take(8)?, 0))
    }

    fn blob16(&mut self) -> Result<Vec<u8>> {
        let len = codec::get_u16(self.take(2)?, 0) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn blob32(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(record: LogRecord) {
        let bytes = record.encode();
        let (decoded, consumed) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn control_records_roundtrip() {
        for body in [
            LogRecordBody::Begin,
            LogRecordBody::Commit { deferred: vec![] },
            LogRecordBody::Commit {
                deferred: vec![
                    DeferredAction::FreePage {
                        page: PageId::new(1, 8),
                        unit: 2,
                    },
                    DeferredAction::DropUnit {
                        container: 1,
                        unit: 3,
                    },
                ],
            },
            LogRecordBody::Abort,
            LogRecordBody::End,
            LogRecordBody::SmoDone {
                undo_next: Lsn(314),
            },
            LogRecordBody::CompensateUnit {
                container: 1,
                unit: 9,
                undo_next: Lsn(55),
            },
        ] {
            roundtrip(LogRecord {
                tx: TxId(9),
                prev_lsn: Lsn(100),
                body,
            });
        }
    }

    #[test]
    fn checkpoint_roundtrip() {
        roundtrip(LogRecord {
            tx: TxId(0),
            prev_lsn: Lsn(0),
            body: LogRecordBody::Checkpoint {
                active: vec![ActiveTxEntry {
                    tx: TxId(4),
                    last_lsn: Lsn(77),
                    undo_next: Lsn(70),
                }],
                dirty: vec![
                    DirtyPageEntry {
                        page: PageId::new(1, 9),
                        redo_lsn: Lsn(33),
                    },
                    DirtyPageEntry {
                        page: PageId::new(2, 4),
                        redo_lsn: Lsn(60),
                    },
                ],
            },
        });
    }

    #[test]
    fn split_record_roundtrip() {
        roundtrip(LogRecord {
            tx: TxId(2),
            prev_lsn: Lsn(8),
            body: LogRecordBody::SplitPage {
                root: PageId::new(1, 2),
                left: PageId::new(1, 5),
                right: PageId::new(1, 6),
                separator: b"mmm".to_vec(),
                left_image: vec![1u8; 512],
                right_image: vec![2u8; 512],
            },
        });
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let record = LogRecord {
            tx: TxId(1),
            prev_lsn: Lsn(0),
            body: LogRecordBody::Begin,
        };
        let mut bytes = record.encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(LogRecord::decode(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn entry_records_roundtrip(
            key in proptest::collection::vec(any::<u8>(), 0..64),
            value in proptest::collection::vec(any::<u8>(), 0..256),
            tx in any::<u64>(),
            prev in any::<u64>(),
        ) {
            let record = LogRecord {
                tx: TxId(tx),
                prev_lsn: Lsn(prev),
                body: LogRecordBody::InsertEntry {
                    root: PageId::new(1, 2),
                    page: PageId::new(1, 77),
                    key: key.clone(),
                    value: value.clone(),
                    vflags: 0,
                },
            };
            let bytes = record.encode();
            let (decoded, consumed) = LogRecord::decode(&bytes).unwrap();
            prop_assert_eq!(consumed, bytes.len());
            prop_assert_eq!(decoded, record);
        }
    }
}
