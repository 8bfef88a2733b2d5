//! Segmented write-ahead log.
//!
//! The log is one logical append-only stream; LSNs are byte offsets into it,
//! starting at one (zero is reserved as "no LSN"). Physically the stream is
//! chopped into rotating segment files so that fully obsolete prefixes can be
//! reclaimed by deleting whole files. A small CRC-protected master file next
//! to the segments remembers the last checkpoint LSN for recovery.

pub mod record;

pub use record::{ActiveTxEntry, DeferredAction, DirtyPageEntry, LogRecord, LogRecordBody};

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::io::{FileIo, StdFileIo};
use crate::types::codec;
use crate::types::{crc32, LogError, Lsn, Result, StoreError};

const SEG_MAGIC: [u8; 4] = *b"VELW";
const SEG_VERSION: u16 = 1;
const SEG_HDR_LEN: usize = 32;

const MASTER_MAGIC: [u8; 4] = *b"VELM";
const MASTER_LEN: usize = 28;

/// When log writes reach stable storage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncMode {
    /// Sync after every append (most durable).
    #[default]
    Full,
    /// Sync only on explicit flushes, i.e. commit and the write-ahead gate.
    Normal,
    /// Never sync; crashes lose the unforced tail. Test use only.
    Off,
}

impl SyncMode {
    /// String form of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Normal => "normal",
            SyncMode::Off => "off",
        }
    }

    /// Parses a mode name, case-insensitive.
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(SyncMode::Full),
            "normal" => Some(SyncMode::Normal),
            "off" => Some(SyncMode::Off),
            _ => None,
        }
    }
}

/// Configuration for the log manager.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Preferred maximum bytes of records per segment file.
    pub segment_bytes: u64,
    /// Sync policy for appends.
    pub sync_mode: SyncMode,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            segment_bytes: 16 * 1024 * 1024,
            sync_mode: SyncMode::Normal,
        }
    }
}

struct Segment {
    index: u32,
    base_lsn: u64,
    len: u64,
    io: StdFileIo,
}

impl Segment {
    fn path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("seg-{index:06}.log"))
    }

    fn create(dir: &Path, index: u32, base_lsn: u64, salt: u64) -> Result<Segment> {
        let io = StdFileIo::open(&Self::path(dir, index))?;
        let mut header = [0u8; SEG_HDR_LEN];
        header[0..4].copy_from_slice(&SEG_MAGIC);
        codec::put_u16(&mut header, 4, SEG_VERSION);
        codec::put_u64(&mut header, 8, salt);
        codec::put_u64(&mut header, 16, base_lsn);
        let crc = crc32(&header[..SEG_HDR_LEN - 8]);
        codec::put_u32(&mut header, SEG_HDR_LEN - 8, crc);
        io.write_at(0, &header)?;
        io.truncate(SEG_HDR_LEN as u64)?;
        io.sync_all()?;
        Ok(Segment {
            index,
            base_lsn,
            len: 0,
            io,
        })
    }

    fn open(dir: &Path, index: u32, salt: u64) -> Result<Segment> {
        let io = StdFileIo::open(&Self::path(dir, index))?;
        let mut header = [0u8; SEG_HDR_LEN];
        io.read_at(0, &mut header)?;
        if header[0..4] != SEG_MAGIC {
            return Err(StoreError::Corruption("log segment magic mismatch"));
        }
        if codec::get_u16(&header, 4) != SEG_VERSION {
            return Err(StoreError::Corruption("log segment version mismatch"));
        }
        let stored_crc = codec::get_u32(&header, SEG_HDR_LEN - 8);
        if crc32(&header[..SEG_HDR_LEN - 8]) != stored_crc {
            return Err(StoreError::Corruption("log segment header crc mismatch"));
        }
        if codec::get_u64(&header, 8) != salt {
            return Err(StoreError::Corruption("log segment salt mismatch"));
        }
        let base_lsn = codec::get_u64(&header, 16);
        let len = io.len()?.saturating_sub(SEG_HDR_LEN as u64);
        Ok(Segment {
            index,
            base_lsn,
            len,
            io,
        })
    }

    /// Walks the records of this segment and drops a torn tail, returning
    /// the number of valid record bytes.
    fn trim_torn_tail(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.len as usize];
        self.io.read_at(SEG_HDR_LEN as u64, &mut buf)?;
        let mut off = 0usize;
        while off < buf.len() {
            match LogRecord::decode(&buf[off..]) {
                Ok((_, consumed)) => off += consumed,
                Err(_) => break,
            }
        }
        if (off as u64) < self.len {
            warn!(
                segment = self.index,
                dropped = self.len - off as u64,
                "dropping torn log tail"
            );
            self.io.truncate(SEG_HDR_LEN as u64 + off as u64)?;
            self.len = off as u64;
        }
        Ok(())
    }
}

struct LogState {
    segments: Vec<Segment>,
    append_lsn: u64,
    durable_lsn: u64,
}

impl LogState {
    fn current(&self) -> &Segment {
        self.segments.last().expect("log always has a segment")
    }

    fn locate(&self, lsn: u64) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|segment| segment.base_lsn <= lsn);
        if idx == 0 {
            return None;
        }
        let segment = &self.segments[idx - 1];
        (lsn < segment.base_lsn + segment.len).then_some(segment)
    }
}

/// The append-only, segmented log of durability records.
pub struct LogManager {
    dir: PathBuf,
    salt: u64,
    opts: LogOptions,
    state: Mutex<LogState>,
}

impl LogManager {
    /// Opens the log under `dir`, creating the first segment when empty and
    /// dropping any torn tail left by a crash.
    pub fn open(dir: &Path, salt: u64, opts: &LogOptions) -> Result<LogManager> {
        fs::create_dir_all(dir).map_err(StoreError::from)?;
        let mut indices = Vec::new();
        for entry in fs::read_dir(dir).map_err(StoreError::from)? {
            let entry = entry.map_err(StoreError::from)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_prefix("seg-").and_then(|s| s.strip_suffix(".log")) {
                if let Ok(index) = stem.parse::<u32>() {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();

        let mut segments = Vec::with_capacity(indices.len().max(1));
        if indices.is_empty() {
            segments.push(Segment::create(dir, 1, 1, salt)?);
        } else {
            for &index in &indices {
                segments.push(Segment::open(dir, index, salt)?);
            }
            for pair in segments.windows(2) {
                if pair[1].base_lsn != pair[0].base_lsn + pair[0].len {
                    return Err(StoreError::Corruption("log segments not contiguous"));
                }
            }
            segments
                .last_mut()
                .expect("non-empty segment list")
                .trim_torn_tail()?;
        }
        let last = segments.last().expect("log always has a segment");
        let append_lsn = last.base_lsn + last.len;
        debug!(
            segments = segments.len(),
            append_lsn, "opened write-ahead log"
        );
        Ok(LogManager {
            dir: dir.to_path_buf(),
            salt,
            opts: opts.clone(),
            state: Mutex::new(LogState {
                segments,
                append_lsn,
                durable_lsn: append_lsn,
            }),
        })
    }

    /// Appends one record and returns its LSN.
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        let bytes = record.encode();
        let mut state = self.state.lock();
        let rolled = {
            let current = state.current();
            current.len > 0 && current.len + bytes.len() as u64 > self.opts.segment_bytes
        };
        if rolled {
            let (index, base) = {
                let current = state.current();
                current.io.sync_all()?;
                (current.index, current.base_lsn + current.len)
            };
            state.durable_lsn = state.durable_lsn.max(base);
            let segment = Segment::create(&self.dir, index + 1, base, self.salt)?;
            info!(segment = segment.index, base_lsn = base, "log segment rollover");
            state.segments.push(segment);
        }
        let lsn = state.append_lsn;
        {
            let current = state.current();
            let offset = SEG_HDR_LEN as u64 + (lsn - current.base_lsn);
            current.io.write_at(offset, &bytes)?;
        }
        state.segments.last_mut().expect("segment").len += bytes.len() as u64;
        state.append_lsn += bytes.len() as u64;
        if self.opts.sync_mode == SyncMode::Full {
            state.current().io.sync_all()?;
            state.durable_lsn = state.append_lsn;
        }
        Ok(Lsn(lsn))
    }

    /// Forces every appended record to stable storage.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.durable_lsn >= state.append_lsn {
            return Ok(());
        }
        if self.opts.sync_mode != SyncMode::Off {
            state.current().io.sync_all()?;
        }
        state.durable_lsn = state.append_lsn;
        Ok(())
    }

    /// Write-ahead gate: ensures the record at `lsn` (and everything before
    /// it) is durable before a page referencing it is written back.
    pub fn flush_through(&self, lsn: Lsn) -> Result<()> {
        {
            let state = self.state.lock();
            if lsn.0 < state.durable_lsn {
                return Ok(());
            }
        }
        self.flush_all()
    }

    /// LSN the next append will receive.
    pub fn append_lsn(&self) -> Lsn {
        Lsn(self.state.lock().append_lsn)
    }

    /// Everything strictly below this LSN is on stable storage.
    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.state.lock().durable_lsn)
    }

    /// Earliest LSN still present in the retained log.
    pub fn first_lsn(&self) -> Lsn {
        Lsn(self.state.lock().segments[0].base_lsn)
    }

    /// Reads the record at `lsn`.
    pub fn get(&self, lsn: Lsn) -> Result<LogRecord> {
        Ok(self.read_record(lsn)?.0)
    }

    /// Reads the record at `lsn` and the LSN immediately after it.
    pub fn read_record(&self, lsn: Lsn) -> Result<(LogRecord, Lsn)> {
        let state = self.state.lock();
        let segment = state
            .locate(lsn.0)
            .ok_or(LogError::UnknownLsn(lsn))?;
        let offset = SEG_HDR_LEN as u64 + (lsn.0 - segment.base_lsn);
        let mut len_buf = [0u8; 4];
        segment.io.read_at(offset, &mut len_buf)?;
        let inner_len = codec::get_u32(&len_buf, 0) as usize;
        let total = 4 + inner_len + 4;
        if lsn.0 + total as u64 > segment.base_lsn + segment.len {
            return Err(LogError::MalformedRecord("record extends past segment").into());
        }
        let mut buf = vec![0u8; total];
        segment.io.read_at(offset, &mut buf)?;
        let (record, consumed) = LogRecord::decode(&buf)?;
        Ok((record, Lsn(lsn.0 + consumed as u64)))
    }

    /// Forward scan starting at `lsn` (clamped to the retained log).
    pub fn scan_from(&self, lsn: Lsn) -> LogScan<'_> {
        let start = lsn.0.max(self.first_lsn().0);
        LogScan {
            log: self,
            next: start,
        }
    }

    /// Deletes whole segments that lie entirely below `lsn`. The caller is
    /// responsible for passing a bound that respects the minimum redo LSN
    /// and the oldest active transaction.
    pub fn truncate_to(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn.0 > state.durable_lsn {
            return Err(LogError::TruncatePastNeeded {
                requested: lsn,
                needed: Lsn(state.durable_lsn),
            }
            .into());
        }
        let mut removed = 0usize;
        while state.segments.len() > 1 {
            let first = &state.segments[0];
            if first.base_lsn + first.len > lsn.0 {
                break;
            }
            let path = Segment::path(&self.dir, first.index);
            fs::remove_file(&path).map_err(StoreError::from)?;
            state.segments.remove(0);
            removed += 1;
        }
        if removed > 0 {
            info!(removed, up_to = lsn.0, "reclaimed log segments");
        }
        Ok(())
    }

    /// Discards all log contents and restarts the stream at LSN one.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        for segment in state.segments.drain(..) {
            fs::remove_file(Segment::path(&self.dir, segment.index)).map_err(StoreError::from)?;
        }
        state.segments.push(Segment::create(&self.dir, 1, 1, self.salt)?);
        state.append_lsn = 1;
        state.durable_lsn = 1;
        Ok(())
    }

    /// Flushes and closes the log.
    pub fn close(&self) -> Result<()> {
        self.flush_all()
    }

    fn master_path(&self) -> PathBuf {
        self.dir.join("master")
    }

    /// Reads the persisted last-checkpoint LSN, if any.
    pub fn read_master(&self) -> Result<Option<Lsn>> {
        let path = self.master_path();
        if !path.exists() {
            return Ok(None);
        }
        let io = StdFileIo::open(&path)?;
        if io.len()? < MASTER_LEN as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; MASTER_LEN];
        io.read_at(0, &mut buf)?;
        if buf[0..4] != MASTER_MAGIC {
            return Err(StoreError::Corruption("log master magic mismatch"));
        }
        let stored_crc = codec::get_u32(&buf, MASTER_LEN - 4);
        if crc32(&buf[..MASTER_LEN - 4]) != stored_crc {
            return Err(StoreError::Corruption("log master crc mismatch"));
        }
        if codec::get_u64(&buf, 8) != self.salt {
            return Err(StoreError::Corruption("log master salt mismatch"));
        }
        Ok(Some(Lsn(codec::get_u64(&buf, 16))))
    }

    /// Persists the last-checkpoint LSN.
    pub fn write_master(&self, checkpoint_lsn: Lsn) -> Result<()> {
        let mut buf = [0u8; MASTER_LEN];
        buf[0..4].copy_from_slice(&MASTER_MAGIC);
        codec::put_u16(&mut buf, 4, SEG_VERSION);
        codec::put_u64(&mut buf, 8, self.salt);
        codec::put_u64(&mut buf, 16, checkpoint_lsn.0);
        let crc = crc32(&buf[..MASTER_LEN - 4]);
        codec::put_u32(&mut buf, MASTER_LEN - 4, crc);
        let io = StdFileIo::open(&self.master_path())?;
        io.write_at(0, &buf)?;
        io.sync_all()
    }
}

/// Forward iterator over log records.
pub struct LogScan<'a> {
    log: &'a LogManager,
    next: u64,
}

impl Iterator for LogScan<'_> {
    type Item = Result<(Lsn, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.log.append_lsn().0 {
            return None;
        }
        match self.log.read_record(Lsn(self.next)) {
            Ok((record, after)) => {
                let lsn = Lsn(self.next);
                self.next = after.0;
                Some(Ok((lsn, record)))
            }
            Err(err) => {
                self.next = u64::MAX;
                Some(Err(err))
            }
        }
    }
}
