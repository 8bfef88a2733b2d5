//! Vellum: an embedded, transactional, paged storage engine.
//!
//! The crate provides the storage substrate of a document database server:
//! durable containers of fixed-size pages behind a pinning buffer manager, a
//! segmented write-ahead log with ARIES-style restart recovery, and a
//! latch-coupled B-link tree index whose structural changes are logged as
//! nested top actions. Everything hangs off an [`Engine`], an explicitly
//! owned registry with a create/open/shutdown lifecycle.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod engine;
pub mod index;
pub mod io;
pub mod latch;
pub mod tx;
pub mod types;
pub mod wal;

pub use engine::{Engine, EngineOptions};
pub use index::{BlinkTree, Cursor, SearchMode};
pub use types::{Lsn, PageId, Result, StoreError, TxId};
