//! Identifier types, the error taxonomy, and the crate-wide `Result` alias.

use std::fmt;
use std::io;
use thiserror::Error;

pub(crate) mod codec;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Container number within an engine instance.
pub type ContainerNo = u8;

/// Logical storage unit within a container. Zero is reserved as "no unit".
pub type UnitId = u8;

/// Block number within a container file. Only the low 24 bits are usable.
pub type BlockNo = u32;

/// Largest addressable block number inside a container.
pub const MAX_BLOCK_NO: BlockNo = 0x00FF_FFFF;

/// Identity of one page: container number in the high byte, block number in
/// the low 24 bits. The all-zero value is reserved as "no page".
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PageId(pub u32);

impl PageId {
    /// Reserved sentinel meaning "no page".
    pub const NONE: PageId = PageId(0);

    /// Packs a container number and block number into one id.
    pub fn new(container: ContainerNo, block: BlockNo) -> Self {
        debug_assert!(block <= MAX_BLOCK_NO, "block number exceeds 24 bits");
        PageId((u32::from(container) << 24) | (block & MAX_BLOCK_NO))
    }

    /// Container number component.
    pub fn container(self) -> ContainerNo {
        (self.0 >> 24) as ContainerNo
    }

    /// Block number component.
    pub fn block(self) -> BlockNo {
        self.0 & MAX_BLOCK_NO
    }

    /// True for the reserved "no page" value.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({}:{})", self.container(), self.block())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container(), self.block())
    }
}

/// Log sequence number: a monotone position in the logical log stream.
/// Zero is reserved as "no LSN"; the stream itself starts at one.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, unique within one engine lifetime.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Buffer manager failures.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The requested page is not allocated in its container.
    #[error("page {0} not found")]
    PageNotFound(PageId),
    /// The requested unit does not exist in the container.
    #[error("unit {0} not found")]
    UnitNotFound(UnitId),
    /// No container is registered under the given number.
    #[error("container {0} not started")]
    ContainerNotStarted(ContainerNo),
    /// Every frame in the pool is pinned.
    #[error("buffer pool exhausted: all frames pinned")]
    NoFreeFrames,
    /// The container cannot grow any further.
    #[error("container {0} is full")]
    ContainerFull(ContainerNo),
    /// The unit id space of the container is exhausted.
    #[error("container {0} has no free unit ids")]
    UnitsExhausted(ContainerNo),
}

/// Log manager failures.
#[derive(Debug, Error)]
pub enum LogError {
    /// A record failed structural or checksum validation.
    #[error("malformed log record: {0}")]
    MalformedRecord(&'static str),
    /// The requested LSN does not address a record in the retained log.
    #[error("LSN {0} not present in log")]
    UnknownLsn(Lsn),
    /// Truncation would discard records still needed for recovery.
    #[error("cannot truncate log to {requested}: {needed} still needed")]
    TruncatePastNeeded {
        /// Truncation point that was asked for.
        requested: Lsn,
        /// Earliest LSN that must stay reachable.
        needed: Lsn,
    },
}

/// Index operation failures.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Insert of a key that already exists in a unique index.
    #[error("duplicate key in unique index")]
    DuplicateKey,
    /// A structural invariant of the tree does not hold.
    #[error("index structure corrupted: {0}")]
    StructuralCorruption(&'static str),
    /// The pair addressed by a delete is not present.
    #[error("entry not found")]
    EntryNotFound,
}

/// Transaction lifecycle failures.
#[derive(Debug, Error)]
pub enum TxError {
    /// An operation was attempted in a state that does not permit it.
    #[error("invalid transaction state: {op} while {state}")]
    InvalidState {
        /// State the transaction was in.
        state: &'static str,
        /// Operation that was attempted.
        op: &'static str,
    },
    /// The transaction is no longer registered with the manager.
    #[error("{0} is not active")]
    NotActive(TxId),
    /// A lock could not be granted within the configured timeout.
    #[error("lock wait timed out")]
    LockTimeout,
}

/// Top-level error for every fallible engine operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Buffer manager failure.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    /// Log manager failure.
    #[error("log error: {0}")]
    Log(#[from] LogError),
    /// Index operation failure.
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    /// Transaction lifecycle failure.
    #[error("transaction error: {0}")]
    Tx(#[from] TxError),
    /// Persistent state failed validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// CRC32 over one buffer.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// CRC32 over a sequence of buffers treated as one stream.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn page_id_packs_both_fields() {
        let id = PageId::new(3, 42);
        assert_eq!(id.container(), 3);
        assert_eq!(id.block(), 42);
        assert!(!id.is_none());
        assert!(PageId::NONE.is_none());
    }

    #[test]
    fn page_id_orders_by_container_then_block() {
        assert!(PageId::new(1, MAX_BLOCK_NO) < PageId::new(2, 0));
        assert!(PageId::new(2, 1) < PageId::new(2, 2));
    }

    proptest! {
        #[test]
        fn page_id_roundtrip(container in 0u8..=255, block in 0u32..=MAX_BLOCK_NO) {
            let id = PageId::new(container, block);
            prop_assert_eq!(id.container(), container);
            prop_assert_eq!(id.block(), block);
            let again = PageId::new(id.container(), id.block());
            prop_assert_eq!(id, again);
        }
    }
}
