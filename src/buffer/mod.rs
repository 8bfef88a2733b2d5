//! Buffer management: the container registry and the per-container page
//! pools behind it.

pub mod container;
pub mod frame;
pub mod pool;

pub use container::{Container, ContainerOptions};
pub use frame::{Frame, PAGE_HDR_LEN};
pub use pool::{BufferPool, BufferStatsSnapshot, PageHandle};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::types::{BufferError, ContainerNo, Lsn, PageId, Result, StoreError};
use crate::wal::LogManager;

/// Registry of started containers and their pools. One per engine instance;
/// owned explicitly, never global.
pub struct BufferManager {
    dir: PathBuf,
    log: Arc<LogManager>,
    salt: u64,
    pools: RwLock<HashMap<ContainerNo, Arc<BufferPool>>>,
}

impl BufferManager {
    /// Creates an empty registry rooted at `dir`.
    pub fn new(dir: &Path, log: Arc<LogManager>, salt: u64) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            log,
            salt,
            pools: RwLock::new(HashMap::new()),
        })
    }

    fn container_path(&self, no: ContainerNo) -> PathBuf {
        self.dir.join(format!("c{no:03}.cnt"))
    }

    /// Creates a new container file and starts a pool over it.
    pub fn create_container(
        &self,
        no: ContainerNo,
        opts: &ContainerOptions,
    ) -> Result<Arc<BufferPool>> {
        let mut pools = self.pools.write();
        if pools.contains_key(&no) {
            return Err(StoreError::Invalid("container number already started"));
        }
        let container = Arc::new(Container::create(
            &self.container_path(no),
            no,
            opts,
            self.salt,
        )?);
        let frames = container.buffer_frames();
        let pool = BufferPool::new(container, Arc::clone(&self.log), frames);
        pools.insert(no, Arc::clone(&pool));
        Ok(pool)
    }

    /// Reattaches an existing container file and starts a pool over it.
    pub fn start_container(&self, no: ContainerNo) -> Result<Arc<BufferPool>> {
        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&no) {
            return Ok(Arc::clone(pool));
        }
        let container = Arc::new(Container::open(&self.container_path(no), self.salt)?);
        let frames = container.buffer_frames();
        let pool = BufferPool::new(container, Arc::clone(&self.log), frames);
        pools.insert(no, Arc::clone(&pool));
        Ok(pool)
    }

    /// Starts every container file found under the registry directory.
    /// Returns the container numbers that were attached.
    pub fn start_all(&self) -> Result<Vec<ContainerNo>> {
        let mut started = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StoreError::from)? {
            let entry = entry.map_err(StoreError::from)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_prefix('c').and_then(|s| s.strip_suffix(".cnt")) else {
                continue;
            };
            let Ok(no) = stem.parse::<ContainerNo>() else {
                continue;
            };
            self.start_container(no)?;
            started.push(no);
        }
        started.sort_unstable();
        info!(containers = started.len(), "attached containers");
        Ok(started)
    }

    /// Stops one container, flushing unless `force`.
    pub fn stop_container(&self, no: ContainerNo, force: bool) -> Result<()> {
        let pool = {
            let mut pools = self.pools.write();
            pools
                .remove(&no)
                .ok_or(BufferError::ContainerNotStarted(no))?
        };
        pool.shutdown(force)
    }

    /// Pool for a started container.
    pub fn pool(&self, no: ContainerNo) -> Result<Arc<BufferPool>> {
        self.pools
            .read()
            .get(&no)
            .cloned()
            .ok_or_else(|| BufferError::ContainerNotStarted(no).into())
    }

    /// Numbers of all started containers.
    pub fn containers(&self) -> Vec<ContainerNo> {
        let mut nos: Vec<_> = self.pools.read().keys().copied().collect();
        nos.sort_unstable();
        nos
    }

    /// Fixes a page by global identity.
    pub fn fix(&self, page_id: PageId) -> Result<PageHandle> {
        self.pool(page_id.container())?.fix(page_id)
    }

    /// Minimum redo LSN across the dirty pages of every started container;
    /// bounds log retention and the recovery redo scan.
    pub fn min_redo_lsn(&self) -> Option<Lsn> {
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        let mut min = None;
        for pool in pools {
            min = match (min, pool.min_redo_lsn()) {
                (None, redo) => redo,
                (cur, None) => cur,
                (Some(a), Some(b)) => Some(a.min(b)),
            };
        }
        min
    }

    /// Dirty pages across every started container with their redo LSNs.
    pub fn dirty_pages(&self) -> Vec<(PageId, Lsn)> {
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        let mut dirty = Vec::new();
        for pool in pools {
            dirty.extend(pool.dirty_pages());
        }
        dirty
    }

    /// Flushes every pool, write-ahead rule included.
    pub fn flush_all(&self) -> Result<()> {
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.flush_all()?;
        }
        Ok(())
    }

    /// Forces every container to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.sync()?;
        }
        Ok(())
    }

    /// Stops every container.
    pub fn shutdown(&self, force: bool) -> Result<()> {
        let drained: Vec<_> = {
            let mut pools = self.pools.write();
            pools.drain().collect()
        };
        for (_, pool) in drained {
            pool.shutdown(force)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{LogManager, LogOptions};
    use tempfile::tempdir;

    fn test_log(dir: &Path) -> Arc<LogManager> {
        let wal_dir = dir.join("wal");
        std::fs::create_dir_all(&wal_dir).unwrap();
        Arc::new(LogManager::open(&wal_dir, 0x5A17, &LogOptions::default()).unwrap())
    }

    fn small_opts() -> ContainerOptions {
        ContainerOptions {
            block_size: 512,
            initial_blocks: 16,
            extend_blocks: 16,
            buffer_frames: 8,
        }
    }

    #[test]
    fn fix_unfix_roundtrip_through_eviction() {
        let dir = tempdir().unwrap();
        let log = test_log(dir.path());
        let buffers = BufferManager::new(dir.path(), log, 0x5A17);
        let pool = buffers.create_container(1, &small_opts()).unwrap();
        let unit = pool.container().create_unit().unwrap();

        // Write distinct patterns into more pages than the pool has frames.
        let mut ids = Vec::new();
        for i in 0u8..32 {
            let handle = pool.allocate(unit, None, None).unwrap();
            {
                let mut frame = handle.exclusive();
                let len = frame.data().len();
                frame.data_mut()[len - 1] = i;
                frame.mark_dirty(crate::types::Lsn(u64::from(i) + 1));
            }
            ids.push(handle.page_id());
        }

        for (i, id) in ids.iter().enumerate() {
            let handle = buffers.fix(*id).unwrap();
            let frame = handle.shared();
            assert_eq!(frame.data()[frame.data().len() - 1], i as u8);
        }
        let stats = pool.stats();
        assert!(stats.evictions > 0, "workload must overflow the pool");
    }

    #[test]
    fn fix_of_unallocated_page_fails() {
        let dir = tempdir().unwrap();
        let log = test_log(dir.path());
        let buffers = BufferManager::new(dir.path(), log, 0x5A17);
        let pool = buffers.create_container(1, &small_opts()).unwrap();
        let err = pool.fix(PageId::new(1, 2)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Buffer(BufferError::PageNotFound(_))
        ));
    }

    #[test]
    fn min_redo_lsn_tracks_earliest_dirty_change() {
        let dir = tempdir().unwrap();
        let log = test_log(dir.path());
        let buffers = BufferManager::new(dir.path(), log, 0x5A17);
        let pool = buffers.create_container(1, &small_opts()).unwrap();
        let unit = pool.container().create_unit().unwrap();

        let a = pool.allocate(unit, None, None).unwrap();
        let b = pool.allocate(unit, None, None).unwrap();
        a.exclusive().mark_dirty(Lsn(40));
        b.exclusive().mark_dirty(Lsn(25));
        b.exclusive().mark_dirty(Lsn(60));

        assert_eq!(buffers.min_redo_lsn(), Some(Lsn(25)));
        b.flush().unwrap();
        assert_eq!(buffers.min_redo_lsn(), Some(Lsn(40)));
        a.flush().unwrap();
        assert_eq!(buffers.min_redo_lsn(), None);
    }

    #[test]
    fn restart_reads_back_flushed_pages() {
        let dir = tempdir().unwrap();
        let page_id;
        {
            let log = test_log(dir.path());
            let buffers = BufferManager::new(dir.path(), log, 0x5A17);
            let pool = buffers.create_container(1, &small_opts()).unwrap();
            let unit = pool.container().create_unit().unwrap();
            let handle = pool.allocate(unit, None, None).unwrap();
            {
                let mut frame = handle.exclusive();
                frame.data_mut()[100] = 0xEE;
                frame.mark_dirty(Lsn(1));
            }
            page_id = handle.page_id();
            drop(handle);
            buffers.shutdown(false).unwrap();
        }
        {
            let log = test_log(dir.path());
            let buffers = BufferManager::new(dir.path(), log, 0x5A17);
            assert_eq!(buffers.start_all().unwrap(), vec![1]);
            let handle = buffers.fix(page_id).unwrap();
            assert_eq!(handle.shared().data()[100], 0xEE);
        }
    }
}
