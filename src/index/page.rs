//! On-page layout for B-link tree nodes.
//!
//! Every page starts with the fixed header the buffer layer owns (unit id,
//! kind byte, embedded LSN), followed by the base header: owning logical page
//! id, entry count, used-space amount, free-space offset, high-key length,
//! right-sibling pointer, flags, and level. The high key sits directly after
//! the base header; records grow upward from there while the slot directory
//! grows downward from the page end, one 2-byte offset per entry in sorted
//! order.
//!
//! Leaf records are `[klen:u16][vlen:u16][vflags:u8][key][value]`; a set
//! overflow bit in `vflags` means the value bytes are an out-of-page
//! reference (`head page:u32`, `total len:u32`). Branch records are
//! `[klen:u16][child:u32][key]`; an empty separator stands in for minus
//! infinity and leads the leftmost branch of each level.

use crate::buffer::PAGE_HDR_LEN;
use crate::types::codec;
use crate::types::{IndexError, PageId, Result, StoreError};

/// Base-header length; the header starts right after the fixed page header.
pub const BASE_HDR_LEN: usize = 20;
const BASE_OFF: usize = PAGE_HDR_LEN;

const SELF_ID_OFF: usize = BASE_OFF;
const NENTRIES_OFF: usize = BASE_OFF + 4;
const USED_OFF: usize = BASE_OFF + 6;
const FREE_OFF: usize = BASE_OFF + 8;
const HIGH_KEY_LEN_OFF: usize = BASE_OFF + 10;
const RIGHT_SIB_OFF: usize = BASE_OFF + 12;
const FLAGS_OFF: usize = BASE_OFF + 16;
const LEVEL_OFF: usize = BASE_OFF + 17;

const HK_OFF: usize = BASE_OFF + BASE_HDR_LEN;

/// Base-header flag: entries are unique by key.
pub const FLAG_UNIQUE: u8 = 0x01;
/// Base-header flag: the stored high key is meaningful (absent means +inf).
pub const FLAG_HAS_HIGH_KEY: u8 = 0x02;

/// Leaf-record value flag: the value is an out-of-page reference.
pub const VFLAG_OVERFLOW: u8 = 0x01;

const SLOT_LEN: usize = 2;
const LEAF_REC_HDR: usize = 5;
const BRANCH_REC_HDR: usize = 6;

/// Byte length of an out-of-page value reference.
pub const OVERFLOW_REF_LEN: usize = 8;

/// Logical kind of an index page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Leaf holding key/value entries.
    Leaf = 1,
    /// Branch holding separator/child entries.
    Branch = 2,
    /// Overflow page holding a slice of an externalized value.
    Overflow = 3,
}

impl PageKind {
    /// Converts the header kind byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Leaf),
            2 => Ok(Self::Branch),
            3 => Ok(Self::Overflow),
            _ => Err(IndexError::StructuralCorruption("unknown index page kind").into()),
        }
    }
}

/// Value of a leaf entry: inline bytes or an out-of-page reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeafValue<'a> {
    /// Bytes stored directly in the page.
    Inline(&'a [u8]),
    /// Reference to an overflow chain.
    Overflow {
        /// First page of the chain.
        head: PageId,
        /// Total value length in bytes.
        total: u32,
    },
}

/// Encodes an overflow reference into its stored byte form.
pub fn encode_overflow_ref(head: PageId, total: u32) -> [u8; OVERFLOW_REF_LEN] {
    let mut raw = [0u8; OVERFLOW_REF_LEN];
    raw[0..4].copy_from_slice(&head.0.to_be_bytes());
    raw[4..8].copy_from_slice(&total.to_be_bytes());
    raw
}

/// Outcome of a leaf position search: exact slot or insertion slot.
pub type PositionOutcome = std::result::Result<usize, usize>;

/// Stored length of a leaf record.
pub fn leaf_record_len(key_len: usize, value_len: usize) -> usize {
    LEAF_REC_HDR + key_len + value_len
}

/// Stored length of a branch record.
pub fn branch_record_len(separator_len: usize) -> usize {
    BRANCH_REC_HDR + separator_len
}

/// Value part of a search target.
#[derive(Clone, Copy, Debug)]
pub enum ValueBound<'a> {
    /// Before every value of the key; used for key-only lookups.
    Min,
    /// Exactly this stored value.
    Exact(&'a [u8]),
    /// After every value of the key; used for `<=` positioning.
    Max,
}

/// A position in entry order: a key plus a value bound. All descent and
/// boundary comparisons go through targets, so duplicate keys order by
/// their stored value bytes and a split may land inside a run.
#[derive(Clone, Copy, Debug)]
pub struct Target<'a> {
    /// Key part.
    pub key: &'a [u8],
    /// Value part.
    pub value: ValueBound<'a>,
}

impl<'a> Target<'a> {
    /// Target at the first position with `key`.
    pub fn key_min(key: &'a [u8]) -> Target<'a> {
        Target {
            key,
            value: ValueBound::Min,
        }
    }

    /// Target at the last position with `key`.
    pub fn key_max(key: &'a [u8]) -> Target<'a> {
        Target {
            key,
            value: ValueBound::Max,
        }
    }

    /// Target at exactly `(key, stored value)`.
    pub fn exact(key: &'a [u8], value: &'a [u8]) -> Target<'a> {
        Target {
            key,
            value: ValueBound::Exact(value),
        }
    }
}

/// Composite boundary keys for separators and high keys: an entry position
/// encoded as `[klen:u16][key][value bytes]`. The empty byte string stands
/// for minus infinity.
pub mod bound {
    use super::*;
    use std::cmp::Ordering;

    /// Encodes a boundary from an entry position.
    pub fn encode(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + key.len() + value.len());
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out
    }

    /// Splits a boundary into its key and value parts. The minus-infinity
    /// boundary decodes to two empty slices.
    pub fn decode(bound: &[u8]) -> Result<(&[u8], &[u8])> {
        if bound.is_empty() {
            return Ok((&[], &[]));
        }
        let klen = codec::get_u16(bound, 0) as usize;
        let key = codec::get_slice(bound, 2, klen)?;
        Ok((key, &bound[2 + klen..]))
    }

    /// Key part of a boundary, `None` for minus infinity.
    pub fn key_part(bound: &[u8]) -> Result<Option<&[u8]>> {
        if bound.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode(bound)?.0))
    }

    /// Orders a stored boundary against a search target.
    pub fn cmp_target(bound: &[u8], target: &Target<'_>) -> Result<Ordering> {
        if bound.is_empty() {
            return Ok(Ordering::Less);
        }
        let (bkey, bvalue) = decode(bound)?;
        Ok(match bkey.cmp(target.key) {
            Ordering::Equal => match target.value {
                ValueBound::Min => Ordering::Greater,
                ValueBound::Exact(value) => bvalue.cmp(value),
                ValueBound::Max => Ordering::Less,
            },
            other => other,
        })
    }
}

/// Read-only view over a leaf or branch page.
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    /// Wraps and validates a page image.
    pub fn parse(data: &'a [u8]) -> Result<PageView<'a>> {
        if data.len() < HK_OFF + SLOT_LEN {
            return Err(IndexError::StructuralCorruption("index page too small").into());
        }
        let view = PageView { data };
        let kind = view.kind()?;
        if kind == PageKind::Overflow {
            return Err(IndexError::StructuralCorruption("overflow page in tree position").into());
        }
        let hk_len = view.high_key_len();
        let n = view.entry_count();
        if HK_OFF + hk_len > data.len() || n * SLOT_LEN > data.len() {
            return Err(IndexError::StructuralCorruption("index page header out of range").into());
        }
        Ok(view)
    }

    /// Page kind.
    pub fn kind(&self) -> Result<PageKind> {
        PageKind::from_u8(self.data[1])
    }

    /// True for leaf pages.
    pub fn is_leaf(&self) -> bool {
        self.data[1] == PageKind::Leaf as u8
    }

    /// Owning logical page id stored in the base header.
    pub fn self_id(&self) -> PageId {
        codec::get_page_id(self.data, SELF_ID_OFF)
    }

    /// Distance from the leaf level; zero for leaves.
    pub fn level(&self) -> u8 {
        self.data[LEVEL_OFF]
    }

    /// Base-header flags.
    pub fn flags(&self) -> u8 {
        self.data[FLAGS_OFF]
    }

    /// True when the index enforces unique keys.
    pub fn unique(&self) -> bool {
        self.flags() & FLAG_UNIQUE != 0
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        codec::get_u16(self.data, NENTRIES_OFF) as usize
    }

    /// Live record bytes in the heap (excludes holes).
    pub fn used_space(&self) -> usize {
        codec::get_u16(self.data, USED_OFF) as usize
    }

    fn free_off(&self) -> usize {
        codec::get_u16(self.data, FREE_OFF) as usize
    }

    fn high_key_len(&self) -> usize {
        codec::get_u16(self.data, HIGH_KEY_LEN_OFF) as usize
    }

    /// Right sibling in key order, if any.
    pub fn right_sibling(&self) -> Option<PageId> {
        let id = codec::get_page_id(self.data, RIGHT_SIB_OFF);
        (!id.is_none()).then_some(id)
    }

    /// Upper bound on the keys this page may hold; `None` means +inf.
    pub fn high_key(&self) -> Option<&'a [u8]> {
        if self.flags() & FLAG_HAS_HIGH_KEY == 0 {
            return None;
        }
        Some(&self.data[HK_OFF..HK_OFF + self.high_key_len()])
    }

    /// B-link coverage test: may the target position legitimately live in
    /// this page, or must the caller follow the sibling chain? Boundary keys
    /// are exclusive upper bounds.
    pub fn covers(&self, target: &Target<'_>) -> Result<bool> {
        match self.high_key() {
            None => Ok(true),
            Some(high) => Ok(bound::cmp_target(high, target)? == std::cmp::Ordering::Greater),
        }
    }

    fn content_off(&self) -> usize {
        HK_OFF + self.high_key_len()
    }

    fn slot_at(&self, idx: usize) -> usize {
        let end = self.data.len();
        codec::get_u16(self.data, end - SLOT_LEN * (idx + 1)) as usize
    }

    fn record_at(&self, idx: usize) -> Result<&'a [u8]> {
        if idx >= self.entry_count() {
            return Err(IndexError::StructuralCorruption("slot index out of range").into());
        }
        let start = self.content_off() + self.slot_at(idx);
        let rec = self
            .data
            .get(start..)
            .ok_or(IndexError::StructuralCorruption("record offset out of range"))?;
        if rec.len() < BRANCH_REC_HDR {
            return Err(IndexError::StructuralCorruption("record shorter than header").into());
        }
        Ok(rec)
    }

    /// Key of entry `idx`.
    pub fn key_at(&self, idx: usize) -> Result<&'a [u8]> {
        let rec = self.record_at(idx)?;
        let klen = codec::get_u16(rec, 0) as usize;
        let hdr = if self.is_leaf() {
            LEAF_REC_HDR
        } else {
            BRANCH_REC_HDR
        };
        codec::get_slice(rec, hdr, klen)
    }

    /// Value of leaf entry `idx`.
    pub fn value_at(&self, idx: usize) -> Result<LeafValue<'a>> {
        debug_assert!(self.is_leaf());
        let rec = self.record_at(idx)?;
        let klen = codec::get_u16(rec, 0) as usize;
        let vlen = codec::get_u16(rec, 2) as usize;
        let vflags = rec[4];
        let raw = codec::get_slice(rec, LEAF_REC_HDR + klen, vlen)?;
        if vflags & VFLAG_OVERFLOW != 0 {
            if vlen != OVERFLOW_REF_LEN {
                return Err(
                    IndexError::StructuralCorruption("malformed overflow reference").into()
                );
            }
            Ok(LeafValue::Overflow {
                head: codec::get_page_id(raw, 0),
                total: codec::get_u32(raw, 4),
            })
        } else {
            Ok(LeafValue::Inline(raw))
        }
    }

    /// Raw stored value bytes of leaf entry `idx` plus its value flags.
    pub fn raw_value_at(&self, idx: usize) -> Result<(&'a [u8], u8)> {
        debug_assert!(self.is_leaf());
        let rec = self.record_at(idx)?;
        let klen = codec::get_u16(rec, 0) as usize;
        let vlen = codec::get_u16(rec, 2) as usize;
        Ok((codec::get_slice(rec, LEAF_REC_HDR + klen, vlen)?, rec[4]))
    }

    /// Child pointer of branch entry `idx`.
    pub fn child_at(&self, idx: usize) -> Result<PageId> {
        debug_assert!(!self.is_leaf());
        let rec = self.record_at(idx)?;
        Ok(codec::get_page_id(rec, 2))
    }

    /// First index whose key is `>= key`, ignoring value order.
    pub fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        let mut lo = 0usize;
        let mut hi = self.entry_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Position of `target` among the leaf entries: `Ok` for an exact match
    /// (only possible with an exact value bound), `Err` for the insertion
    /// index.
    pub fn leaf_position(&self, target: &Target<'_>) -> Result<PositionOutcome> {
        debug_assert!(self.is_leaf());
        let mut lo = 0usize;
        let mut hi = self.entry_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.entry_cmp_target(mid, target)? {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(Err(lo))
    }

    fn entry_cmp_target(&self, idx: usize, target: &Target<'_>) -> Result<std::cmp::Ordering> {
        use std::cmp::Ordering;
        let key_order = self.key_at(idx)?.cmp(target.key);
        if key_order != Ordering::Equal {
            return Ok(key_order);
        }
        Ok(match target.value {
            ValueBound::Min => Ordering::Greater,
            ValueBound::Max => Ordering::Less,
            ValueBound::Exact(value) => self.raw_value_at(idx)?.0.cmp(value),
        })
    }

    /// Child to descend into for `target`: the last separator `<= target`.
    /// The leading minus-infinity separator guarantees a match.
    pub fn choose_child(&self, target: &Target<'_>) -> Result<(usize, PageId)> {
        use std::cmp::Ordering;
        let n = self.entry_count();
        if n == 0 {
            return Err(IndexError::StructuralCorruption("empty branch page").into());
        }
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if bound::cmp_target(self.key_at(mid)?, target)? == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let idx = lo.saturating_sub(1).min(n - 1);
        Ok((idx, self.child_at(idx)?))
    }

    /// Insertion index for a separator boundary in a branch, plus whether
    /// an identical boundary is already present.
    pub fn branch_position(&self, target: &Target<'_>) -> Result<(usize, bool)> {
        use std::cmp::Ordering;
        debug_assert!(!self.is_leaf());
        let n = self.entry_count();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if bound::cmp_target(self.key_at(mid)?, target)? == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let exact = lo > 0 && bound::cmp_target(self.key_at(lo - 1)?, target)? == Ordering::Equal;
        Ok((lo, exact))
    }

    /// Bytes available for one more record plus its slot.
    pub fn free_space(&self) -> usize {
        let heap_end = self.content_off() + self.free_off();
        let slot_start = self.data.len() - self.entry_count() * SLOT_LEN;
        slot_start.saturating_sub(heap_end)
    }

    /// Live bytes a compaction would retain (records plus slots).
    pub fn live_space(&self) -> usize {
        self.used_space() + self.entry_count() * SLOT_LEN
    }

    /// Capacity of the record area (after header and high key).
    pub fn capacity(&self) -> usize {
        self.data.len() - self.content_off()
    }

    fn record_len(&self, idx: usize) -> Result<usize> {
        let rec = self.record_at(idx)?;
        let klen = codec::get_u16(rec, 0) as usize;
        Ok(if self.is_leaf() {
            LEAF_REC_HDR + klen + codec::get_u16(rec, 2) as usize
        } else {
            BRANCH_REC_HDR + klen
        })
    }
}

/// Mutable access to a leaf or branch page.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Wraps a mutable page image; callers must have validated or formatted
    /// it first.
    pub fn new(data: &'a mut [u8]) -> PageMut<'a> {
        PageMut { data }
    }

    /// Read-only view of the current state.
    pub fn view(&self) -> PageView<'_> {
        PageView { data: self.data }
    }

    /// Formats `data` as an empty leaf or branch page. Leaves the fixed
    /// header's unit byte and LSN untouched.
    pub fn format(
        data: &mut [u8],
        self_id: PageId,
        kind: PageKind,
        level: u8,
        flags: u8,
        high_key: Option<&[u8]>,
        right_sibling: Option<PageId>,
    ) -> Result<()> {
        data[1] = kind as u8;
        data[HK_OFF..].fill(0);
        codec::put_page_id(data, SELF_ID_OFF, self_id);
        codec::put_u16(data, NENTRIES_OFF, 0);
        codec::put_u16(data, USED_OFF, 0);
        codec::put_u16(data, FREE_OFF, 0);
        data[LEVEL_OFF] = level;
        let mut stored_flags = flags & FLAG_UNIQUE;
        match high_key {
            Some(high) => {
                if HK_OFF + high.len() + SLOT_LEN >= data.len() {
                    return Err(StoreError::Invalid("high key too long for page"));
                }
                stored_flags |= FLAG_HAS_HIGH_KEY;
                codec::put_u16(data, HIGH_KEY_LEN_OFF, high.len() as u16);
                data[HK_OFF..HK_OFF + high.len()].copy_from_slice(high);
            }
            None => codec::put_u16(data, HIGH_KEY_LEN_OFF, 0),
        }
        data[FLAGS_OFF] = stored_flags;
        codec::put_page_id(
            data,
            RIGHT_SIB_OFF,
            right_sibling.unwrap_or(PageId::NONE),
        );
        Ok(())
    }

    /// Updates the right-sibling pointer.
    pub fn set_right_sibling(&mut self, sibling: Option<PageId>) {
        codec::put_page_id(
            self.data,
            RIGHT_SIB_OFF,
            sibling.unwrap_or(PageId::NONE),
        );
    }

    /// Inserts a leaf record at sorted position `idx`, compacting first when
    /// the heap is fragmented. Fails with `Invalid` when the record cannot
    /// fit even after compaction; the caller splits then.
    pub fn insert_leaf(&mut self, idx: usize, key: &[u8], value: &[u8], vflags: u8) -> Result<()> {
        let rec_len = LEAF_REC_HDR + key.len() + value.len();
        self.ensure_room(rec_len)?;
        let heap_off = {
            let view = self.view();
            view.free_off()
        };
        let content = HK_OFF + codec::get_u16(self.data, HIGH_KEY_LEN_OFF) as usize;
        let start = content + heap_off;
        codec::put_u16(self.data, start, key.len() as u16);
        codec::put_u16(self.data, start + 2, value.len() as u16);
        self.data[start + 4] = vflags;
        self.data[start + LEAF_REC_HDR..start + LEAF_REC_HDR + key.len()].copy_from_slice(key);
        self.data[start + LEAF_REC_HDR + key.len()..start + rec_len].copy_from_slice(value);
        self.finish_insert(idx, heap_off, rec_len)
    }

    /// Inserts a branch record at sorted position `idx`.
    pub fn insert_branch(&mut self, idx: usize, key: &[u8], child: PageId) -> Result<()> {
        let rec_len = BRANCH_REC_HDR + key.len();
        self.ensure_room(rec_len)?;
        let heap_off = self.view().free_off();
        let content = HK_OFF + codec::get_u16(self.data, HIGH_KEY_LEN_OFF) as usize;
        let start = content + heap_off;
        codec::put_u16(self.data, start, key.len() as u16);
        codec::put_page_id(self.data, start + 2, child);
        self.data[start + BRANCH_REC_HDR..start + rec_len].copy_from_slice(key);
        self.finish_insert(idx, heap_off, rec_len)
    }

    /// Removes the record at `idx`. The heap bytes become a hole reclaimed
    /// by a later compaction.
    pub fn remove(&mut self, idx: usize) -> Result<()> {
        let (n, rec_len) = {
            let view = self.view();
            (view.entry_count(), view.record_len(idx)?)
        };
        if idx >= n {
            return Err(IndexError::StructuralCorruption("remove index out of range").into());
        }
        let end = self.data.len();
        // Slots for idx+1..n slide toward the end by one slot.
        self.data
            .copy_within(end - SLOT_LEN * n..end - SLOT_LEN * (idx + 1), end - SLOT_LEN * n + SLOT_LEN);
        codec::put_u16(self.data, NENTRIES_OFF, (n - 1) as u16);
        let used = codec::get_u16(self.data, USED_OFF) as usize - rec_len;
        codec::put_u16(self.data, USED_OFF, used as u16);
        Ok(())
    }

    fn ensure_room(&mut self, rec_len: usize) -> Result<()> {
        let (free, live, capacity) = {
            let view = self.view();
            (view.free_space(), view.live_space(), view.capacity())
        };
        let needed = rec_len + SLOT_LEN;
        if free >= needed {
            return Ok(());
        }
        if live + needed <= capacity {
            self.compact()?;
            return Ok(());
        }
        Err(StoreError::Invalid("page full"))
    }

    /// Rewrites the heap without holes.
    pub fn compact(&mut self) -> Result<()> {
        let n = self.view().entry_count();
        let mut records = Vec::with_capacity(n);
        {
            let view = self.view();
            for idx in 0..n {
                let rec = view.record_at(idx)?;
                let len = view.record_len(idx)?;
                records.push(rec[..len].to_vec());
            }
        }
        let content = HK_OFF + codec::get_u16(self.data, HIGH_KEY_LEN_OFF) as usize;
        let mut off = 0usize;
        let end = self.data.len();
        for (idx, rec) in records.iter().enumerate() {
            self.data[content + off..content + off + rec.len()].copy_from_slice(rec);
            codec::put_u16(self.data, end - SLOT_LEN * (idx + 1), off as u16);
            off += rec.len();
        }
        codec::put_u16(self.data, FREE_OFF, off as u16);
        codec::put_u16(self.data, USED_OFF, off as u16);
        Ok(())
    }

    fn finish_insert(&mut self, idx: usize, heap_off: usize, rec_len: usize) -> Result<()> {
        let n = self.view().entry_count();
        if idx > n {
            return Err(IndexError::StructuralCorruption("insert index out of range").into());
        }
        let end = self.data.len();
        // Slots idx..n slide one position away from the end to open slot idx.
        self.data
            .copy_within(end - SLOT_LEN * n..end - SLOT_LEN * idx, end - SLOT_LEN * (n + 1));
        codec::put_u16(self.data, end - SLOT_LEN * (idx + 1), heap_off as u16);
        codec::put_u16(self.data, NENTRIES_OFF, (n + 1) as u16);
        let used = codec::get_u16(self.data, USED_OFF) as usize + rec_len;
        codec::put_u16(self.data, USED_OFF, used as u16);
        let free = codec::get_u16(self.data, FREE_OFF) as usize + rec_len;
        codec::put_u16(self.data, FREE_OFF, free as u16);
        Ok(())
    }
}

/// Overflow-page field offsets: next-page pointer and payload length.
pub mod overflow {
    use super::*;

    const NEXT_OFF: usize = BASE_OFF;
    const LEN_OFF: usize = BASE_OFF + 4;
    const DATA_OFF: usize = BASE_OFF + 6;

    /// Payload bytes one overflow page can hold.
    pub fn capacity(page_len: usize) -> usize {
        page_len - DATA_OFF
    }

    /// Formats an overflow page with `payload` and a next pointer.
    pub fn format(data: &mut [u8], next: Option<PageId>, payload: &[u8]) -> Result<()> {
        if payload.len() > capacity(data.len()) {
            return Err(StoreError::Invalid("overflow payload too long"));
        }
        data[1] = PageKind::Overflow as u8;
        codec::put_page_id(data, NEXT_OFF, next.unwrap_or(PageId::NONE));
        codec::put_u16(data, LEN_OFF, payload.len() as u16);
        data[DATA_OFF..DATA_OFF + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Next page in the chain, if any.
    pub fn next(data: &[u8]) -> Option<PageId> {
        let id = codec::get_page_id(data, NEXT_OFF);
        (!id.is_none()).then_some(id)
    }

    /// Payload slice of an overflow page.
    pub fn payload(data: &[u8]) -> Result<&[u8]> {
        if data[1] != PageKind::Overflow as u8 {
            return Err(IndexError::StructuralCorruption("expected overflow page").into());
        }
        let len = codec::get_u16(data, LEN_OFF) as usize;
        codec::get_slice(data, DATA_OFF, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 512;

    fn leaf_page() -> Vec<u8> {
        let mut data = vec![0u8; PAGE];
        PageMut::format(
            &mut data,
            PageId::new(1, 2),
            PageKind::Leaf,
            0,
            0,
            None,
            None,
        )
        .unwrap();
        data
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data);
        for key in [b"m", b"a", b"z", b"k"] {
            let idx = page.view().lower_bound(key).unwrap();
            page.insert_leaf(idx, key, b"v", 0).unwrap();
        }
        let view = PageView::parse(&data).unwrap();
        assert_eq!(view.entry_count(), 4);
        let keys: Vec<_> = (0..4).map(|i| view.key_at(i).unwrap().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"k".to_vec(), b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn remove_then_compact_reclaims_space() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data);
        for i in 0u8..10 {
            let key = [i];
            page.insert_leaf(i as usize, &key, &[0u8; 20], 0).unwrap();
        }
        let before = page.view().free_space();
        for _ in 0..5 {
            page.remove(0).unwrap();
        }
        assert_eq!(page.view().entry_count(), 5);
        assert_eq!(page.view().key_at(0).unwrap(), &[5u8]);
        // Holes are not free space yet.
        assert_eq!(page.view().free_space(), before + 5 * SLOT_LEN);
        page.compact().unwrap();
        assert!(page.view().free_space() > before);
        assert_eq!(page.view().key_at(0).unwrap(), &[5u8]);
    }

    #[test]
    fn page_full_reports_invalid() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data);
        let mut inserted = 0usize;
        loop {
            let key = (inserted as u32).to_be_bytes();
            let idx = page.view().lower_bound(&key).unwrap();
            match page.insert_leaf(idx, &key, &[7u8; 40], 0) {
                Ok(()) => inserted += 1,
                Err(StoreError::Invalid(_)) => break,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(inserted >= 8, "512-byte page should hold several records");
    }

    #[test]
    fn high_key_bounds_coverage() {
        let mut data = vec![0u8; PAGE];
        let high = bound::encode(b"mm", b"v0");
        PageMut::format(
            &mut data,
            PageId::new(1, 3),
            PageKind::Leaf,
            0,
            0,
            Some(&high),
            Some(PageId::new(1, 4)),
        )
        .unwrap();
        let view = PageView::parse(&data).unwrap();
        assert_eq!(view.high_key(), Some(&high[..]));
        assert!(view.covers(&Target::key_min(b"aa")).unwrap());
        assert!(view.covers(&Target::key_min(b"mm")).unwrap());
        assert!(!view.covers(&Target::key_max(b"mm")).unwrap());
        assert!(!view.covers(&Target::key_min(b"mn")).unwrap());
        assert_eq!(view.right_sibling(), Some(PageId::new(1, 4)));
    }

    #[test]
    fn branch_choose_child_picks_last_separator_below() {
        let mut data = vec![0u8; PAGE];
        PageMut::format(
            &mut data,
            PageId::new(1, 9),
            PageKind::Branch,
            1,
            0,
            None,
            None,
        )
        .unwrap();
        let mut page = PageMut::new(&mut data);
        page.insert_branch(0, b"", PageId::new(1, 10)).unwrap();
        page.insert_branch(1, &bound::encode(b"h", b""), PageId::new(1, 11))
            .unwrap();
        page.insert_branch(2, &bound::encode(b"p", b""), PageId::new(1, 12))
            .unwrap();

        let view = PageView::parse(&data).unwrap();
        let child = |key: &[u8]| view.choose_child(&Target::key_min(key)).unwrap().1;
        assert_eq!(child(b"a"), PageId::new(1, 10));
        assert_eq!(child(b"h"), PageId::new(1, 10));
        assert_eq!(
            view.choose_child(&Target::key_max(b"h")).unwrap().1,
            PageId::new(1, 11)
        );
        assert_eq!(child(b"o"), PageId::new(1, 11));
        assert_eq!(child(b"z"), PageId::new(1, 12));
    }

    #[test]
    fn leaf_position_orders_duplicates_by_value() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data);
        page.insert_leaf(0, b"k", b"a", 0).unwrap();
        page.insert_leaf(1, b"k", b"c", 0).unwrap();
        let view = PageView::parse(&data).unwrap();
        assert_eq!(view.leaf_position(&Target::key_min(b"k")).unwrap(), Err(0));
        assert_eq!(view.leaf_position(&Target::exact(b"k", b"a")).unwrap(), Ok(0));
        assert_eq!(view.leaf_position(&Target::exact(b"k", b"b")).unwrap(), Err(1));
        assert_eq!(view.leaf_position(&Target::key_max(b"k")).unwrap(), Err(2));
    }

    #[test]
    fn overflow_reference_roundtrips() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data);
        let stored = encode_overflow_ref(PageId::new(1, 30), 9000);
        page.insert_leaf(0, b"big", &stored, VFLAG_OVERFLOW).unwrap();
        let view = PageView::parse(&data).unwrap();
        match view.value_at(0).unwrap() {
            LeafValue::Overflow { head, total } => {
                assert_eq!(head, PageId::new(1, 30));
                assert_eq!(total, 9000);
            }
            other => panic!("expected overflow value, got {other:?}"),
        }
    }

    #[test]
    fn overflow_page_payload_roundtrips() {
        let mut data = vec![0u8; PAGE];
        let payload = vec![0xA5u8; 100];
        overflow::format(&mut data, Some(PageId::new(1, 7)), &payload).unwrap();
        assert_eq!(overflow::next(&data), Some(PageId::new(1, 7)));
        assert_eq!(overflow::payload(&data).unwrap(), &payload[..]);
    }
}
