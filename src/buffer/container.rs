//! Container files: fixed-block-size extents with a persisted descriptor,
//! interleaved allocation-table blocks, and logical units for group
//! deallocation.
//!
//! Block address space: block 0 holds the descriptor; every group of
//! `block_size + 1` following blocks starts with one allocation-table block
//! (one unit byte per data block in the group, zero meaning free) and carries
//! `block_size` data blocks. Dropping a unit therefore touches only the table
//! blocks, never the data pages.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::io::{FileIo, StdFileIo};
use crate::types::codec;
use crate::types::{BlockNo, BufferError, ContainerNo, Result, StoreError, UnitId, MAX_BLOCK_NO};

const DESC_MAGIC: [u8; 4] = *b"VELC";
const DESC_VERSION: u16 = 1;
const DESC_LEN: usize = 68;
const UNIT_BITMAP_OFF: usize = 32;
const UNIT_BITMAP_LEN: usize = 32;

/// Sizing and growth parameters for one container.
#[derive(Clone, Debug)]
pub struct ContainerOptions {
    /// Size of each block in bytes.
    pub block_size: u32,
    /// Number of data blocks provisioned at creation.
    pub initial_blocks: u32,
    /// Number of data blocks added when the container grows.
    pub extend_blocks: u32,
    /// Number of page frames the owning buffer pool keeps in memory.
    pub buffer_frames: u32,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            initial_blocks: 64,
            extend_blocks: 64,
            buffer_frames: 128,
        }
    }
}

struct Descriptor {
    container_no: ContainerNo,
    unit_bitmap: [u8; UNIT_BITMAP_LEN],
    block_size: u32,
    initial_blocks: u32,
    extend_blocks: u32,
    buffer_frames: u32,
    salt: u64,
}

impl Descriptor {
    fn encode(&self, out: &mut [u8]) {
        out[..DESC_LEN].fill(0);
        out[0..4].copy_from_slice(&DESC_MAGIC);
        codec::put_u16(out, 4, DESC_VERSION);
        out[6] = self.container_no;
        codec::put_u32(out, 8, self.block_size);
        codec::put_u32(out, 12, self.initial_blocks);
        codec::put_u32(out, 16, self.extend_blocks);
        codec::put_u64(out, 20, self.salt);
        codec::put_u32(out, 28, self.buffer_frames);
        out[UNIT_BITMAP_OFF..UNIT_BITMAP_OFF + UNIT_BITMAP_LEN].copy_from_slice(&self.unit_bitmap);
        let crc = crate::types::crc32(&out[..DESC_LEN - 4]);
        codec::put_u32(out, DESC_LEN - 4, crc);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < DESC_LEN {
            return Err(StoreError::Corruption("container descriptor truncated"));
        }
        if src[0..4] != DESC_MAGIC {
            return Err(StoreError::Corruption("container magic mismatch"));
        }
        if codec::get_u16(src, 4) != DESC_VERSION {
            return Err(StoreError::Corruption("container format version mismatch"));
        }
        let stored_crc = codec::get_u32(src, DESC_LEN - 4);
        if crate::types::crc32(&src[..DESC_LEN - 4]) != stored_crc {
            return Err(StoreError::Corruption("container descriptor crc mismatch"));
        }
        let mut unit_bitmap = [0u8; UNIT_BITMAP_LEN];
        unit_bitmap.copy_from_slice(&src[UNIT_BITMAP_OFF..UNIT_BITMAP_OFF + UNIT_BITMAP_LEN]);
        Ok(Self {
            container_no: src[6],
            unit_bitmap,
            block_size: codec::get_u32(src, 8),
            initial_blocks: codec::get_u32(src, 12),
            extend_blocks: codec::get_u32(src, 16),
            buffer_frames: codec::get_u32(src, 28),
            salt: codec::get_u64(src, 20),
        })
    }

    fn unit_alive(&self, unit: UnitId) -> bool {
        unit != 0 && self.unit_bitmap[(unit / 8) as usize] & (1 << (unit % 8)) != 0
    }

    fn set_unit(&mut self, unit: UnitId, alive: bool) {
        let byte = &mut self.unit_bitmap[(unit / 8) as usize];
        if alive {
            *byte |= 1 << (unit % 8);
        } else {
            *byte &= !(1 << (unit % 8));
        }
    }
}

struct AllocState {
    desc: Descriptor,
    /// One unit byte per data slot; slot order follows group layout.
    entries: Vec<u8>,
    free: BTreeSet<u32>,
    dirty_groups: BTreeSet<u32>,
    desc_dirty: bool,
    groups: u32,
}

/// One fixed-block-size storage extent.
pub struct Container {
    no: ContainerNo,
    block_size: usize,
    io: Arc<dyn FileIo>,
    state: Mutex<AllocState>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("no", &self.no)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Creates a new container file with `initial_blocks` of data capacity.
    pub fn create(
        path: &Path,
        no: ContainerNo,
        opts: &ContainerOptions,
        salt: u64,
    ) -> Result<Container> {
        if opts.block_size < 512 || !opts.block_size.is_power_of_two() {
            return Err(StoreError::Invalid(
                "container block size must be a power of two >= 512",
            ));
        }
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        if !io.is_empty()? {
            return Err(StoreError::Invalid("container file already exists"));
        }
        let desc = Descriptor {
            container_no: no,
            unit_bitmap: [0u8; UNIT_BITMAP_LEN],
            block_size: opts.block_size,
            initial_blocks: opts.initial_blocks,
            extend_blocks: opts.extend_blocks,
            buffer_frames: opts.buffer_frames,
            salt,
        };
        let block_size = opts.block_size as usize;
        let groups = groups_for(opts.initial_blocks, block_size);
        let container = Container {
            no,
            block_size,
            io,
            state: Mutex::new(AllocState {
                desc,
                entries: Vec::new(),
                free: BTreeSet::new(),
                dirty_groups: BTreeSet::new(),
                desc_dirty: true,
                groups: 0,
            }),
        };
        {
            let mut state = container.state.lock();
            container.grow_locked(&mut state, groups)?;
        }
        container.flush_meta()?;
        container.sync()?;
        info!(container = no, blocks = opts.initial_blocks, "created container");
        Ok(container)
    }

    /// Reattaches an existing container file, validating its descriptor.
    pub fn open(path: &Path, expected_salt: u64) -> Result<Container> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        let mut first = vec![0u8; DESC_LEN];
        io.read_at(0, &mut first)?;
        let desc = Descriptor::decode(&first)?;
        if desc.salt != expected_salt {
            return Err(StoreError::Corruption("container salt mismatch"));
        }
        let block_size = desc.block_size as usize;
        let file_blocks = io.len()? / block_size as u64;
        let groups = if file_blocks <= 1 {
            0
        } else {
            ((file_blocks - 1) / (block_size as u64 + 1)) as u32
        };
        let no = desc.container_no;
        let container = Container {
            no,
            block_size,
            io,
            state: Mutex::new(AllocState {
                desc,
                entries: Vec::new(),
                free: BTreeSet::new(),
                dirty_groups: BTreeSet::new(),
                desc_dirty: false,
                groups: 0,
            }),
        };
        {
            let mut state = container.state.lock();
            let mut table = vec![0u8; block_size];
            for group in 0..groups {
                container
                    .io
                    .read_at(block_offset(table_block(group, block_size), block_size), &mut table)?;
                let base = state.entries.len() as u32;
                state.entries.extend_from_slice(&table);
                for (idx, &unit) in table.iter().enumerate() {
                    if unit == 0 {
                        state.free.insert(base + idx as u32);
                    }
                }
            }
            state.groups = groups;
        }
        debug!(container = no, groups, "opened container");
        Ok(container)
    }

    /// Container number.
    pub fn no(&self) -> ContainerNo {
        self.no
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Frame count the descriptor requests for this container's pool.
    pub fn buffer_frames(&self) -> usize {
        self.state.lock().desc.buffer_frames as usize
    }

    /// Creates a fresh unit and returns its id.
    pub fn create_unit(&self) -> Result<UnitId> {
        let mut state = self.state.lock();
        for unit in 1..=u8::MAX {
            if !state.desc.unit_alive(unit) {
                state.desc.set_unit(unit, true);
                state.desc_dirty = true;
                debug!(container = self.no, unit, "created unit");
                return Ok(unit);
            }
        }
        Err(BufferError::UnitsExhausted(self.no).into())
    }

    /// Forces a specific unit id into existence; recovery replay of a unit
    /// creation. Idempotent.
    pub fn create_unit_at(&self, unit: UnitId) -> Result<()> {
        if unit == 0 {
            return Err(StoreError::Invalid("unit id zero is reserved"));
        }
        let mut state = self.state.lock();
        if !state.desc.unit_alive(unit) {
            state.desc.set_unit(unit, true);
            state.desc_dirty = true;
        }
        Ok(())
    }

    /// Drops a unit, freeing every block tagged with it. Returns the freed
    /// block numbers so callers can invalidate buffered pages.
    pub fn drop_unit(&self, unit: UnitId) -> Result<Vec<BlockNo>> {
        let mut state = self.state.lock();
        if !state.desc.unit_alive(unit) {
            return Err(BufferError::UnitNotFound(unit).into());
        }
        let mut freed = Vec::new();
        for slot in 0..state.entries.len() as u32 {
            if state.entries[slot as usize] == unit {
                state.entries[slot as usize] = 0;
                state.free.insert(slot);
                state.dirty_groups.insert(slot / self.block_size as u32);
                freed.push(slot_to_block(slot, self.block_size));
            }
        }
        state.desc.set_unit(unit, false);
        state.desc_dirty = true;
        debug!(container = self.no, unit, blocks = freed.len(), "dropped unit");
        Ok(freed)
    }

    /// True if the unit currently exists.
    pub fn unit_exists(&self, unit: UnitId) -> bool {
        self.state.lock().desc.unit_alive(unit)
    }

    /// Allocates one block in `unit`, growing the file when the free list is
    /// exhausted. `requested` forces a specific block number (recovery replay
    /// of an allocation); forcing an already-allocated block is idempotent.
    pub fn allocate(&self, unit: UnitId, requested: Option<BlockNo>) -> Result<BlockNo> {
        let mut state = self.state.lock();
        if !state.desc.unit_alive(unit) {
            return Err(BufferError::UnitNotFound(unit).into());
        }
        let slot = match requested {
            Some(block) => {
                let slot = block_to_slot(block, self.block_size)
                    .ok_or(StoreError::Invalid("requested block is not a data block"))?;
                while slot >= state.entries.len() as u32 {
                    let next = state.groups + 1;
                    self.grow_locked(&mut state, next)?;
                }
                state.free.remove(&slot);
                slot
            }
            None => match state.free.iter().next().copied() {
                Some(slot) => {
                    state.free.remove(&slot);
                    slot
                }
                None => {
                    let extend = state.desc.extend_blocks.max(1);
                    let target = state.groups + groups_for(extend, self.block_size).max(1);
                    self.grow_locked(&mut state, target)?;
                    let slot = *state
                        .free
                        .iter()
                        .next()
                        .ok_or(BufferError::ContainerFull(self.no))?;
                    state.free.remove(&slot);
                    slot
                }
            },
        };
        state.entries[slot as usize] = unit;
        state.dirty_groups.insert(slot / self.block_size as u32);
        Ok(slot_to_block(slot, self.block_size))
    }

    /// Returns a block to the free pool. Freeing a free block is idempotent.
    pub fn free(&self, block: BlockNo) -> Result<()> {
        let mut state = self.state.lock();
        let slot = block_to_slot(block, self.block_size)
            .ok_or(StoreError::Invalid("freed block is not a data block"))?;
        if slot >= state.entries.len() as u32 {
            return Ok(());
        }
        if state.entries[slot as usize] != 0 {
            state.entries[slot as usize] = 0;
            state.free.insert(slot);
            state.dirty_groups.insert(slot / self.block_size as u32);
        }
        Ok(())
    }

    /// Unit owning `block`, or `None` if the block is free.
    pub fn block_unit(&self, block: BlockNo) -> Option<UnitId> {
        let state = self.state.lock();
        let slot = block_to_slot(block, self.block_size)?;
        match state.entries.get(slot as usize) {
            Some(&unit) if unit != 0 => Some(unit),
            _ => None,
        }
    }

    /// True if `block` is currently allocated.
    pub fn is_allocated(&self, block: BlockNo) -> bool {
        self.block_unit(block).is_some()
    }

    /// Reads one block into `buf` (must be exactly one block long).
    pub fn read_block(&self, block: BlockNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.io
            .read_at(block_offset(block, self.block_size), buf)
    }

    /// Writes one block from `buf` (must be exactly one block long).
    pub fn write_block(&self, block: BlockNo, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.io
            .write_at(block_offset(block, self.block_size), buf)
    }

    /// Writes the descriptor and any dirty allocation-table blocks.
    pub fn flush_meta(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.desc_dirty {
            let mut block = vec![0u8; self.block_size];
            state.desc.encode(&mut block);
            self.io.write_at(0, &block)?;
            state.desc_dirty = false;
        }
        let dirty: Vec<u32> = state.dirty_groups.iter().copied().collect();
        for group in dirty {
            let start = (group * self.block_size as u32) as usize;
            let end = (start + self.block_size).min(state.entries.len());
            let mut table = vec![0u8; self.block_size];
            table[..end - start].copy_from_slice(&state.entries[start..end]);
            self.io.write_at(
                block_offset(table_block(group, self.block_size), self.block_size),
                &table,
            )?;
        }
        state.dirty_groups.clear();
        Ok(())
    }

    /// Forces all container writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn grow_locked(&self, state: &mut AllocState, target_groups: u32) -> Result<()> {
        while state.groups < target_groups {
            let group = state.groups;
            let last_block = table_block(group, self.block_size) as u64 + self.block_size as u64;
            if last_block > MAX_BLOCK_NO as u64 {
                return Err(BufferError::ContainerFull(self.no).into());
            }
            let new_len = (last_block + 1) * self.block_size as u64;
            self.io.truncate(new_len)?;
            let base = state.entries.len() as u32;
            state.entries.resize(state.entries.len() + self.block_size, 0);
            for idx in 0..self.block_size as u32 {
                state.free.insert(base + idx);
            }
            state.dirty_groups.insert(group);
            state.groups += 1;
            debug!(container = self.no, group, "extended container");
        }
        Ok(())
    }
}

fn groups_for(data_blocks: u32, block_size: usize) -> u32 {
    data_blocks.div_ceil(block_size as u32)
}

fn table_block(group: u32, block_size: usize) -> BlockNo {
    1 + group * (block_size as u32 + 1)
}

fn slot_to_block(slot: u32, block_size: usize) -> BlockNo {
    let group = slot / block_size as u32;
    let off = slot % block_size as u32;
    table_block(group, block_size) + 1 + off
}

fn block_to_slot(block: BlockNo, block_size: usize) -> Option<u32> {
    if block == 0 {
        return None;
    }
    let rel = block - 1;
    let span = block_size as u32 + 1;
    let off = rel % span;
    if off == 0 {
        return None;
    }
    Some((rel / span) * block_size as u32 + off - 1)
}

fn block_offset(block: BlockNo, block_size: usize) -> u64 {
    block as u64 * block_size as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_opts() -> ContainerOptions {
        ContainerOptions {
            block_size: 512,
            initial_blocks: 8,
            extend_blocks: 8,
            buffer_frames: 16,
        }
    }

    #[test]
    fn create_allocate_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1.cnt");
        let opts = small_opts();

        let (unit, block) = {
            let container = Container::create(&path, 1, &opts, 0xABCD).unwrap();
            let unit = container.create_unit().unwrap();
            let block = container.allocate(unit, None).unwrap();
            let mut buf = vec![0u8; 512];
            buf[0] = 0x7E;
            container.write_block(block, &buf).unwrap();
            container.flush_meta().unwrap();
            container.sync().unwrap();
            (unit, block)
        };

        let container = Container::open(&path, 0xABCD).unwrap();
        assert_eq!(container.block_unit(block), Some(unit));
        let mut buf = vec![0u8; 512];
        container.read_block(block, &mut buf).unwrap();
        assert_eq!(buf[0], 0x7E);
    }

    #[test]
    fn open_rejects_wrong_salt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1.cnt");
        Container::create(&path, 1, &small_opts(), 1).unwrap();
        let err = Container::open(&path, 2).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn drop_unit_frees_only_its_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1.cnt");
        let container = Container::create(&path, 1, &small_opts(), 7).unwrap();
        let a = container.create_unit().unwrap();
        let b = container.create_unit().unwrap();
        let blocks_a: Vec<_> = (0..3).map(|_| container.allocate(a, None).unwrap()).collect();
        let block_b = container.allocate(b, None).unwrap();

        let freed = container.drop_unit(a).unwrap();
        assert_eq!(freed.len(), 3);
        for block in blocks_a {
            assert!(!container.is_allocated(block));
        }
        assert_eq!(container.block_unit(block_b), Some(b));
        assert!(!container.unit_exists(a));
    }

    #[test]
    fn allocation_grows_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1.cnt");
        let container = Container::create(&path, 1, &small_opts(), 7).unwrap();
        let unit = container.create_unit().unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..600 {
            let block = container.allocate(unit, None).unwrap();
            assert!(seen.insert(block), "allocator handed out {block} twice");
        }
    }

    #[test]
    fn forced_allocation_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1.cnt");
        let container = Container::create(&path, 1, &small_opts(), 7).unwrap();
        let unit = container.create_unit().unwrap();
        let block = container.allocate(unit, None).unwrap();
        let again = container.allocate(unit, Some(block)).unwrap();
        assert_eq!(block, again);
        let fresh = container.allocate(unit, None).unwrap();
        assert_ne!(fresh, block);
    }
}
