//! An in-memory [`BackingStore`] used only by this crate's own test
//! suite. Not a mock framework — `objectio-block` doesn't reach for
//! `mockall` either, it hand-rolls fixtures at this scale.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::BackingStore;
use crate::error::{CacheError, CacheResult};
use crate::file::{File, FileKey};
use crate::parts::PartIdx;

#[derive(Default)]
struct NamespaceState {
    files: HashMap<String, File>,
    parts: HashMap<String, HashMap<PartIdx, Bytes>>,
}

/// A simple in-memory backing store, useful for exercising `BlockStore`
/// without a real database.
#[derive(Default)]
pub struct InMemoryBackingStore {
    namespaces: Mutex<HashMap<String, NamespaceState>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly inspect a file's durably-stored parts (test assertions
    /// reach for this instead of poking at cache internals).
    pub fn durable_parts(&self, key: &FileKey) -> HashMap<PartIdx, Bytes> {
        self.namespaces
            .lock()
            .get(&key.namespace_id)
            .and_then(|ns| ns.parts.get(&key.name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn durable_file(&self, key: &FileKey) -> Option<File> {
        self.namespaces
            .lock()
            .get(&key.namespace_id)
            .and_then(|ns| ns.files.get(&key.name))
            .cloned()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn insert_file(&self, file: &File) -> CacheResult<()> {
        let mut namespaces = self.namespaces.lock();
        let ns = namespaces.entry(file.namespace_id.clone()).or_default();
        if ns.files.contains_key(&file.name) {
            return Err(CacheError::backend(
                "insertFile",
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "file exists"),
            ));
        }
        ns.files.insert(file.name.clone(), file.clone());
        ns.parts.entry(file.name.clone()).or_default();
        Ok(())
    }

    async fn delete_file(&self, namespace_id: &str, name: &str) -> CacheResult<()> {
        if let Some(ns) = self.namespaces.lock().get_mut(namespace_id) {
            ns.files.remove(name);
            ns.parts.remove(name);
        }
        Ok(())
    }

    async fn get_file(&self, namespace_id: &str, name: &str) -> CacheResult<Option<File>> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace_id)
            .and_then(|ns| ns.files.get(name))
            .cloned())
    }

    async fn list_files(&self, namespace_id: &str) -> CacheResult<Vec<File>> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace_id)
            .map(|ns| ns.files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_namespaces(&self) -> CacheResult<Vec<String>> {
        Ok(self.namespaces.lock().keys().cloned().collect())
    }

    async fn list_file_names(&self, namespace_id: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace_id)
            .map(|ns| ns.files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_parts(
        &self,
        namespace_id: &str,
        name: &str,
        indices: &[PartIdx],
    ) -> CacheResult<HashMap<PartIdx, Bytes>> {
        let namespaces = self.namespaces.lock();
        let Some(parts) = namespaces
            .get(namespace_id)
            .and_then(|ns| ns.parts.get(name))
        else {
            return Ok(HashMap::new());
        };
        Ok(indices
            .iter()
            .filter_map(|idx| parts.get(idx).map(|data| (*idx, data.clone())))
            .collect())
    }

    async fn write_cache_entry(
        &self,
        namespace_id: &str,
        name: &str,
        file: Option<&File>,
        parts: &[(PartIdx, Bytes)],
    ) -> CacheResult<()> {
        let mut namespaces = self.namespaces.lock();
        let ns = namespaces.entry(namespace_id.to_string()).or_default();
        if let Some(file) = file {
            ns.files.insert(name.to_string(), file.clone());
        }
        let part_map = ns.parts.entry(name.to_string()).or_default();
        for (idx, data) in parts {
            part_map.insert(*idx, data.clone());
        }
        Ok(())
    }
}

/// Convenience: an `Arc`-wrapped store, the shape `BlockStore::new` wants.
pub fn in_memory_backend() -> Arc<InMemoryBackingStore> {
    Arc::new(InMemoryBackingStore::new())
}
