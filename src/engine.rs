//! The engine: an explicitly owned bundle of the container registry, log
//! manager, and transaction manager, with a create/open/shutdown lifecycle.
//!
//! Opening an existing directory always runs restart recovery before
//! returning, then takes a checkpoint so the next restart scans as little
//! log as possible.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tracing::info;

use crate::buffer::{BufferManager, BufferPool, ContainerOptions};
use crate::io::{FileIo, StdFileIo};
use crate::tx::recovery::{self, RecoveryStats};
use crate::tx::{TxHandle, TxManager};
use crate::types::codec;
use crate::types::{crc32, ContainerNo, Lsn, Result, StoreError};
use crate::wal::{LogManager, LogOptions};

const META_MAGIC: [u8; 4] = *b"VELE";
const META_VERSION: u16 = 1;
const META_LEN: usize = 20;
const META_FILE: &str = "engine.meta";
const WAL_DIR: &str = "wal";

/// Top-level configuration for an engine instance.
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    /// Defaults applied to containers created through the engine.
    pub container: ContainerOptions,
    /// Log manager configuration.
    pub log: LogOptions,
}

/// One storage engine instance rooted at a directory.
pub struct Engine {
    dir: PathBuf,
    opts: EngineOptions,
    log: Arc<LogManager>,
    buffers: Arc<BufferManager>,
    txs: Arc<TxManager>,
}

impl Engine {
    /// Initializes a fresh engine directory.
    pub fn create(dir: &Path, opts: EngineOptions) -> Result<Engine> {
        fs::create_dir_all(dir).map_err(StoreError::from)?;
        if dir.join(META_FILE).exists() {
            return Err(StoreError::Invalid("engine directory already initialized"));
        }
        let salt: u64 = rand::thread_rng().gen();
        write_meta(&dir.join(META_FILE), salt)?;
        let engine = Self::assemble(dir, opts, salt)?;
        info!(path = %dir.display(), "created engine");
        Ok(engine)
    }

    /// Reattaches an existing engine directory and runs restart recovery.
    pub fn open(dir: &Path, opts: EngineOptions) -> Result<(Engine, RecoveryStats)> {
        let salt = read_meta(&dir.join(META_FILE))?;
        let engine = Self::assemble(dir, opts, salt)?;
        engine.buffers.start_all()?;
        let stats = recovery::recover(&engine.txs)?;
        engine.checkpoint()?;
        info!(path = %dir.display(), redone = stats.redone, undone = stats.undone, "opened engine");
        Ok((engine, stats))
    }

    fn assemble(dir: &Path, opts: EngineOptions, salt: u64) -> Result<Engine> {
        let log = Arc::new(LogManager::open(&dir.join(WAL_DIR), salt, &opts.log)?);
        let buffers = BufferManager::new(dir, Arc::clone(&log), salt);
        let txs = TxManager::new(Arc::clone(&log), Arc::clone(&buffers));
        Ok(Engine {
            dir: dir.to_path_buf(),
            opts,
            log,
            buffers,
            txs,
        })
    }

    /// Engine directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Creates a container with the engine's default sizing.
    pub fn create_container(&self, no: ContainerNo) -> Result<Arc<BufferPool>> {
        self.buffers.create_container(no, &self.opts.container)
    }

    /// Creates a container with explicit sizing.
    pub fn create_container_with(
        &self,
        no: ContainerNo,
        opts: &ContainerOptions,
    ) -> Result<Arc<BufferPool>> {
        self.buffers.create_container(no, opts)
    }

    /// Starts a new transaction.
    pub fn begin(&self) -> Result<TxHandle> {
        self.txs.begin()
    }

    /// Buffer registry accessor.
    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    /// Transaction manager accessor.
    pub fn txs(&self) -> &Arc<TxManager> {
        &self.txs
    }

    /// Log manager accessor.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Flushes all buffers, takes a fuzzy checkpoint, and reclaims obsolete
    /// log segments.
    pub fn checkpoint(&self) -> Result<()> {
        self.buffers.flush_all()?;
        self.buffers.sync_all()?;
        let checkpoint_lsn = self.txs.checkpoint()?;
        let mut bound = checkpoint_lsn;
        if let Some(redo) = self.buffers.min_redo_lsn() {
            bound = bound.min(redo);
        }
        if let Some(first) = self.txs.oldest_active_first_lsn() {
            bound = bound.min(first);
        }
        self.log.truncate_to(bound)?;
        Ok(())
    }

    /// Shuts the engine down; `force` skips the final flush and checkpoint,
    /// simulating a crash.
    pub fn shutdown(self, force: bool) -> Result<()> {
        if !force {
            self.checkpoint()?;
        }
        self.buffers.shutdown(force)?;
        if !force {
            self.log.close()?;
        }
        info!(force, "engine shut down");
        Ok(())
    }

    /// Lowest LSN that must stay in the log; diagnostics.
    pub fn min_retained_lsn(&self) -> Lsn {
        self.log.first_lsn()
    }
}

fn write_meta(path: &Path, salt: u64) -> Result<()> {
    let mut buf = [0u8; META_LEN];
    buf[0..4].copy_from_slice(&META_MAGIC);
    codec::put_u16(&mut buf, 4, META_VERSION);
    codec::put_u64(&mut buf, 8, salt);
    let crc = crc32(&buf[..META_LEN - 4]);
    codec::put_u32(&mut buf, META_LEN - 4, crc);
    let io = StdFileIo::open(path)?;
    io.write_at(0, &buf)?;
    io.sync_all()
}

fn read_meta(path: &Path) -> Result<u64> {
    let io = StdFileIo::open(path)?;
    if io.len()? < META_LEN as u64 {
        return Err(StoreError::Corruption("engine meta file truncated"));
    }
    let mut buf = [0u8; META_LEN];
    io.read_at(0, &mut buf)?;
    if buf[0..4] != META_MAGIC {
        return Err(StoreError::Corruption("engine meta magic mismatch"));
    }
    if codec::get_u16(&buf, 4) != META_VERSION {
        return Err(StoreError::Corruption("engine meta version mismatch"));
    }
    let stored_crc = codec::get_u32(&buf, META_LEN - 4);
    if crc32(&buf[..META_LEN - 4]) != stored_crc {
        return Err(StoreError::Corruption("engine meta crc mismatch"));
    }
    Ok(codec::get_u64(&buf, 8))
}
