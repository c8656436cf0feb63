//! The backing-store contract: the narrow interface
//! `BlockStore` consumes from the durable file/part store. Implementing
//! the store itself is out of scope for this crate — callers bring their
//! own (SQL, key-value, object storage, ...).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheResult;
use crate::file::File;
use crate::parts::PartIdx;

/// The abstract persistent file/part store `BlockStore` reads through and
/// flushes to.
///
/// Every method is named after the operation it performs rather than
/// after any particular backend's API, so a SQL store, a KV store, or an
/// object store can all implement it directly.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Insert a brand-new file descriptor. Must fail if one already
    /// exists for the same `(namespace_id, name)`.
    async fn insert_file(&self, file: &File) -> CacheResult<()>;

    /// Delete a file and all of its parts.
    async fn delete_file(&self, namespace_id: &str, name: &str) -> CacheResult<()>;

    /// Fetch a file's durable descriptor, or `None` if it doesn't exist.
    async fn get_file(&self, namespace_id: &str, name: &str) -> CacheResult<Option<File>>;

    /// List every file's durable descriptor within a namespace.
    async fn list_files(&self, namespace_id: &str) -> CacheResult<Vec<File>>;

    /// List every namespace that has at least one file.
    async fn list_namespaces(&self) -> CacheResult<Vec<String>>;

    /// List the names of every file in a namespace, without fetching
    /// their descriptors. A thinner alternative to `list_files` for
    /// callers that only need the name (`DeleteBlock`-style fan-out).
    async fn list_file_names(&self, namespace_id: &str) -> CacheResult<Vec<String>>;

    /// Fetch the requested parts of a file. Parts that don't exist are
    /// simply absent from the returned map.
    async fn get_parts(
        &self,
        namespace_id: &str,
        name: &str,
        indices: &[PartIdx],
    ) -> CacheResult<HashMap<PartIdx, Bytes>>;

    /// Atomically persist a file descriptor (if present) and a set of
    /// dirty parts. Either all of it lands, or none of it does, from the
    /// point of view of any concurrent `get_file`/`get_parts` caller.
    async fn write_cache_entry(
        &self,
        namespace_id: &str,
        name: &str,
        file: Option<&File>,
        parts: &[(PartIdx, Bytes)],
    ) -> CacheResult<()>;
}
