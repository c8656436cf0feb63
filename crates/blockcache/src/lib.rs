#![allow(clippy::result_large_err)]
//! blockcache
//!
//! An in-memory write-through cache for namespaced, partitioned binary
//! files backed by an external key-value or relational store.
//!
//! Every write lands in memory first and is acknowledged once the cache's
//! invariants are satisfied; a background flusher (or an on-demand
//! [`BlockStore::flush_cache`] call) drains dirty buffers to whatever
//! [`BackingStore`] the caller provides. Reads overlay in-memory state on
//! top of the backing store, so a caller never observes a write it hasn't
//! yet been acknowledged for disappear.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  BlockStore  │  pin / intention registry, read & write API
//! │  (one lock)  │
//! └──────┬───────┘
//!        │ keyed by (namespace_id, name)
//! ┌──────▼───────┐
//! │  CacheEntry  │  FileBuffer + sparse Vec<PartBuffer>
//! └──────┬───────┘
//!        │ drained by
//! ┌──────▼───────┐
//! │   Flusher    │  periodic tokio::time::interval loop
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐
//! │ BackingStore │  (caller-supplied: SQL, KV, object storage, ...)
//! └──────────────┘
//! ```

pub mod backend;
pub mod buffer;
pub mod entry;
pub mod error;
pub mod file;
pub mod flusher;
pub mod parts;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use backend::BackingStore;
pub use entry::{IntentionId, WriteIntention};
pub use error::{CacheError, CacheResult};
pub use file::{File, FileKey, FileOpts};
pub use flusher::{spawn as spawn_flusher, FlusherHandle, DEFAULT_FLUSH_INTERVAL};
pub use parts::{PartIdx, PartRange, NO_PART_IDX, PART_SIZE};
pub use store::{BlockStore, BlockStoreConfig};
