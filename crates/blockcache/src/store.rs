//! `BlockStore`: the keyed registry of [`CacheEntry`] records, the global
//! lock, and the public read/write/lifecycle API.
//!
//! Generalizes `objectio-block`'s `WriteCache` (per-volume
//! `RwLock<BTreeMap<...>>` caches, `cache.rs`) to a single coarse lock,
//! and is the first real caller of the `BackingStore` seam
//! `objectio-block` declares a dependency on but never calls itself.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::backend::BackingStore;
use crate::buffer::{
    begin_flush_file, begin_flush_part, complete_flush_file, complete_flush_part, cow_write_file,
    install_clean_file, loaded_part, PartBuffer,
};
use crate::entry::{CacheEntry, IntentionId, WriteIntention};
use crate::error::{CacheError, CacheResult};
use crate::file::{File, FileKey, FileOpts};
use crate::parts::{compute_part_map, incomplete_parts, last_incomplete_part, partition_range, PartIdx};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn not_found(key: &FileKey) -> CacheError {
    CacheError::NotFound {
        namespace_id: key.namespace_id.clone(),
        name: key.name.clone(),
    }
}

fn file_deleted(key: &FileKey) -> CacheError {
    CacheError::FileDeleted {
        namespace_id: key.namespace_id.clone(),
        name: key.name.clone(),
    }
}

/// Configuration for a [`BlockStore`].
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// How often the background flusher drains dirty entries.
    pub flush_interval: std::time::Duration,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: crate::flusher::DEFAULT_FLUSH_INTERVAL,
        }
    }
}

struct Inner {
    entries: HashMap<FileKey, CacheEntry>,
    next_intention_id: IntentionId,
}

/// The in-memory write-through cache: the keyed registry, global lock,
/// and public read/write/lifecycle API.
pub struct BlockStore {
    backend: Arc<dyn BackingStore>,
    inner: Mutex<Inner>,
    #[allow(dead_code)]
    config: BlockStoreConfig,
}

/// Pins `key` for the lifetime of the guard and, once [`OpGuard::register`]
/// is called, registers a write intention too. Both are released on
/// `Drop`, so every exit path of a public operation — including an early
/// `?` — releases them.
struct OpGuard<'a> {
    store: &'a BlockStore,
    key: FileKey,
    intention_id: IntentionId,
}

impl<'a> OpGuard<'a> {
    fn pin(store: &'a BlockStore, key: FileKey) -> Self {
        store.pin(&key);
        Self {
            store,
            key,
            intention_id: 0,
        }
    }

    fn register(&mut self, intention: WriteIntention) {
        self.intention_id = self.store.register_intention(&self.key, intention);
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if self.intention_id != 0 {
            self.store.clear_intention(&self.key, self.intention_id);
        }
        self.store.unpin(&self.key);
    }
}

impl BlockStore {
    pub fn new(backend: Arc<dyn BackingStore>) -> Self {
        Self::with_config(backend, BlockStoreConfig::default())
    }

    pub fn with_config(backend: Arc<dyn BackingStore>, config: BlockStoreConfig) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_intention_id: 1,
            }),
            config,
        }
    }

    // ---- §4.2 pin / intention registry ------------------------------------

    fn pin(&self, key: &FileKey) {
        let mut inner = self.inner.lock();
        inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(&key.namespace_id, &key.name))
            .pin();
    }

    fn unpin(&self, key: &FileKey) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.unpin() => {}
            Some(_) => warn!(namespace_id = %key.namespace_id, name = %key.name, "unpin on entry with zero pins"),
            None => warn!(namespace_id = %key.namespace_id, name = %key.name, "unpin on absent entry"),
        }
    }

    fn register_intention(&self, key: &FileKey, intention: WriteIntention) -> IntentionId {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(key) {
            return 0;
        }
        let id = inner.next_intention_id;
        inner.next_intention_id += 1;
        inner.entries.get_mut(key).unwrap().add_intention(id, intention);
        id
    }

    fn clear_intention(&self, key: &FileKey, id: IntentionId) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.remove_intention(id) => {}
            Some(_) => warn!(namespace_id = %key.namespace_id, name = %key.name, intention_id = id, "clear of absent intention"),
            None => warn!(namespace_id = %key.namespace_id, name = %key.name, intention_id = id, "clear-intention on absent entry"),
        }
    }

    fn try_delete_locked(inner: &mut Inner, key: &FileKey) -> bool {
        match inner.entries.get(key) {
            None => true,
            Some(entry) if entry.is_evictable() => {
                inner.entries.remove(key);
                true
            }
            Some(_) => false,
        }
    }

    fn try_delete(&self, key: &FileKey) -> bool {
        let mut inner = self.inner.lock();
        Self::try_delete_locked(&mut inner, key)
    }

    /// Like `try_delete_locked`, but additionally refuses to evict an
    /// entry that has dirty buffers right now — used after a flush
    /// completes, where the buffers we just wrote may no longer be the
    /// entry's current ones (a concurrent write could have COW-replaced
    /// a selected slot with a fresh dirty buffer while the flush's
    /// backend write was in flight).
    fn try_delete_if_clean_locked(inner: &mut Inner, key: &FileKey) -> bool {
        match inner.entries.get(key) {
            None => true,
            Some(entry) if entry.is_evictable() && !entry.has_dirty_buffers() => {
                inner.entries.remove(key);
                true
            }
            Some(_) => false,
        }
    }

    /// Mutate the file descriptor held by `entry`'s slot, following the
    /// copy-on-write rule. Fails `NotFound` if no
    /// `FileBuffer` is installed yet.
    fn mutate_file_buffer<R>(
        entry: &mut CacheEntry,
        key: &FileKey,
        mutate: impl FnOnce(&mut File) -> R,
    ) -> CacheResult<R> {
        match entry.file_buffer_mut_slot() {
            Some(slot) => Ok(cow_write_file(slot, mutate)),
            None => Err(not_found(key)),
        }
    }

    /// Apply a previously computed partition plan against `entry`,
    /// consuming `data` in plan order.
    fn write_plan_into_entry(entry: &mut CacheEntry, plan: &[crate::parts::PartRange], data: &[u8]) {
        let mut consumed = 0usize;
        for range in plan {
            let len = range.len as usize;
            let slot = entry.part_slot_mut(range.part_idx);
            if slot.is_none() {
                *slot = Some(loaded_part(range.part_idx, Bytes::new()));
            }
            let buf = slot.as_mut().expect("just installed");
            crate::buffer::cow_write_part(buf, range.offset_in_part, &data[consumed..consumed + len]);
            consumed += len;
        }
    }

    // ---- §4.6 load paths ----------------------------------------------------

    /// Load the file descriptor, installing a cache entry the first time
    /// it is seen.
    async fn load_file_info(&self, key: &FileKey) -> CacheResult<File> {
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(key) {
                if entry.is_deleted() {
                    return Err(not_found(key));
                }
                if let Some(fb) = entry.file_buffer() {
                    return Ok(fb.file().clone());
                }
            }
        }

        let fetched = self
            .backend
            .get_file(&key.namespace_id, &key.name)
            .await?
            .ok_or_else(|| not_found(key))?;

        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(&key.namespace_id, &key.name));
        if entry.is_deleted() {
            return Err(file_deleted(key));
        }
        if let Some(fb) = entry.file_buffer() {
            return Ok(fb.file().clone());
        }
        entry.set_file_buffer(install_clean_file(fetched.clone()));
        Ok(fetched)
    }

    /// Fetch `indices` from the backing store and install each returned
    /// part iff its slot is currently empty — first writer wins.
    async fn load_data_parts(&self, key: &FileKey, indices: &[PartIdx]) -> CacheResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let fetched = self
            .backend
            .get_parts(&key.namespace_id, &key.name, indices)
            .await?;

        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(&key.namespace_id, &key.name));
        if let Some(&max_idx) = indices.iter().max() {
            entry.ensure_capacity(max_idx);
        }
        for (idx, data) in fetched {
            entry.install_loaded_part_if_absent(idx, loaded_part(idx, data));
        }
        Ok(())
    }

    async fn load_last_data_block(&self, key: &FileKey, file: &File) -> CacheResult<()> {
        if let Some(idx) = last_incomplete_part(file) {
            self.load_data_parts(key, &[idx]).await?;
        }
        Ok(())
    }

    // ---- §4.5 file lifecycle -------------------------------------------------

    /// Create a new file. Fails `FileExists` if a live file is already
    /// there, `FileBusy` if a deleted-but-still-referenced entry occupies
    /// the slot.
    pub async fn make_file(
        &self,
        namespace_id: &str,
        name: &str,
        meta: HashMap<String, Value>,
        opts: FileOpts,
    ) -> CacheResult<File> {
        let opts = opts.normalized()?;
        let key = FileKey::new(namespace_id, name);

        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(&key) {
                if !entry.is_deleted() {
                    return Err(CacheError::FileExists {
                        namespace_id: namespace_id.to_string(),
                        name: name.to_string(),
                    });
                }
                if entry.is_evictable() {
                    inner.entries.remove(&key);
                } else {
                    return Err(CacheError::FileBusy {
                        namespace_id: namespace_id.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }

        let now = now_ms();
        let file = File {
            namespace_id: namespace_id.to_string(),
            name: name.to_string(),
            opts,
            created_ts: now,
            mod_ts: now,
            size: 0,
            meta,
        };
        self.backend.insert_file(&file).await?;
        Ok(file)
    }

    /// Delete a file: ask the backing store first, then mark the cache
    /// entry deleted (if still referenced) or remove it outright.
    pub async fn delete_file(&self, namespace_id: &str, name: &str) -> CacheResult<()> {
        self.backend.delete_file(namespace_id, name).await?;
        let key = FileKey::new(namespace_id, name);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            if entry.pin_count() > 0 || entry.has_intentions() {
                entry.mark_deleted();
            } else {
                inner.entries.remove(&key);
            }
        }
        Ok(())
    }

    /// Enumerate every file in `namespace_id` via the backing store and
    /// delete each one.
    pub async fn delete_block(&self, namespace_id: &str) -> CacheResult<()> {
        let names = self.backend.list_file_names(namespace_id).await?;
        for name in names {
            self.delete_file(namespace_id, &name).await?;
        }
        Ok(())
    }

    /// The cached file descriptor when present, else the backing store's
    /// record. Never creates a cache entry.
    pub async fn stat(&self, namespace_id: &str, name: &str) -> CacheResult<File> {
        let key = FileKey::new(namespace_id, name);
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(&key) {
                if entry.is_deleted() {
                    return Err(not_found(&key));
                }
                if let Some(fb) = entry.file_buffer() {
                    return Ok(fb.file().clone());
                }
            }
        }
        self.backend
            .get_file(namespace_id, name)
            .await?
            .ok_or_else(|| not_found(&key))
    }

    /// List files in a namespace, overlaying the cache's view and
    /// filtering out entries that are deleted or not yet metadata-loaded.
    pub async fn list_files(&self, namespace_id: &str) -> CacheResult<Vec<File>> {
        let backend_files = self.backend.list_files(namespace_id).await?;
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(backend_files.len());
        for file in backend_files {
            let key = FileKey::new(namespace_id, file.name.clone());
            match inner.entries.get(&key) {
                None => out.push(file),
                Some(entry) => {
                    if entry.is_deleted() {
                        continue;
                    }
                    if let Some(fb) = entry.file_buffer() {
                        out.push(fb.file().clone());
                    }
                    // else: loaded entry with no fileBuffer yet, filtered out.
                }
            }
        }
        Ok(out)
    }

    /// All namespaces known to the backing store (a "block id" here is
    /// a namespace, matching the source's `GetAllBlockIds`).
    pub async fn get_all_block_ids(&self) -> CacheResult<Vec<String>> {
        self.backend.list_namespaces().await
    }

    /// Merge or replace a file's metadata map.
    pub async fn write_meta(
        &self,
        namespace_id: &str,
        name: &str,
        patch: HashMap<String, Value>,
        merge: bool,
    ) -> CacheResult<()> {
        let key = FileKey::new(namespace_id, name);
        let _guard = OpGuard::pin(self, key.clone());

        self.load_file_info(&key).await?;

        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if entry.is_deleted() {
            return Err(file_deleted(&key));
        }
        let now = now_ms();
        Self::mutate_file_buffer(entry, &key, |f| {
            f.apply_meta(patch, merge);
            f.mod_ts = now;
        })?;
        Ok(())
    }

    // ---- §4.7 write operations ------------------------------------------------

    /// Append `data` at the file's current end.
    pub async fn append_data(&self, namespace_id: &str, name: &str, data: &[u8]) -> CacheResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let key = FileKey::new(namespace_id, name);
        let mut guard = OpGuard::pin(self, key.clone());
        guard.register(WriteIntention::Append);

        let file = self.load_file_info(&key).await?;
        self.load_last_data_block(&key, &file).await?;

        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if entry.is_deleted() {
            return Err(file_deleted(&key));
        }
        let now = now_ms();
        let start_off = Self::mutate_file_buffer(entry, &key, |f| {
            let start = f.size;
            f.size += data.len() as u64;
            f.mod_ts = now;
            start
        })?;
        let plan = partition_range(&file, start_off, data.len() as u64);
        Self::write_plan_into_entry(entry, &plan, data);
        Ok(())
    }

    /// Replace the whole file with `data`.
    pub async fn write_file(&self, namespace_id: &str, name: &str, data: &[u8]) -> CacheResult<()> {
        let key = FileKey::new(namespace_id, name);
        let mut guard = OpGuard::pin(self, key.clone());
        guard.register(WriteIntention::Replace);

        let file = self.load_file_info(&key).await?;

        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if entry.is_deleted() {
            return Err(file_deleted(&key));
        }
        entry.clear_parts();
        let now = now_ms();
        Self::mutate_file_buffer(entry, &key, |f| {
            f.size = data.len() as u64;
            f.mod_ts = now;
        })?;
        let plan = partition_range(&file, 0, data.len() as u64);
        Self::write_plan_into_entry(entry, &plan, data);
        Ok(())
    }

    /// Write `data` at `offset`, with circular trimming and part-level
    /// copy-on-write mutation.
    pub async fn write_at(
        &self,
        namespace_id: &str,
        name: &str,
        offset: i64,
        data: &[u8],
    ) -> CacheResult<()> {
        if offset < 0 {
            return Err(CacheError::InvalidArgument("offset must not be negative".into()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let key = FileKey::new(namespace_id, name);
        let mut guard = OpGuard::pin(self, key.clone());

        let file = self.load_file_info(&key).await?;
        let offset = offset as u64;
        if offset > file.size {
            return Err(CacheError::InvalidArgument(format!(
                "offset {offset} exceeds current size {}",
                file.size
            )));
        }

        let (offset, data) = match trim_for_circular_window(&file, offset, data) {
            Some(trimmed) => trimmed,
            None => return Ok(()), // entirely before the live window: silently dropped
        };
        if data.is_empty() {
            return Ok(());
        }

        let part_map = compute_part_map(&file, offset, data.len() as u64);
        guard.register(WriteIntention::Partial(part_map));

        let incomplete = incomplete_parts(&file, offset, data.len() as u64);
        self.load_data_parts(&key, &incomplete).await?;

        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if entry.is_deleted() {
            return Err(file_deleted(&key));
        }
        let now = now_ms();
        let write_end = offset + data.len() as u64;
        Self::mutate_file_buffer(entry, &key, |f| {
            if write_end > f.size {
                f.size = write_end;
            }
            f.mod_ts = now;
        })?;
        let plan = partition_range(&file, offset, data.len() as u64);
        Self::write_plan_into_entry(entry, &plan, data);
        Ok(())
    }

    // ---- §4.8 read operations -------------------------------------------------

    /// Read `size` bytes starting at `offset`, clamping for circular
    /// files and live size, overlaying cached parts on top of the
    /// backing store's response. Returns the
    /// (possibly-adjusted) offset actually read from, and the bytes.
    pub async fn read_at(
        &self,
        namespace_id: &str,
        name: &str,
        offset: i64,
        size: u64,
    ) -> CacheResult<(i64, Vec<u8>)> {
        if offset < 0 {
            return Err(CacheError::InvalidArgument("offset must not be negative".into()));
        }
        let key = FileKey::new(namespace_id, name);
        let _guard = OpGuard::pin(self, key.clone());

        let file = self.stat(namespace_id, name).await?;

        let mut offset = offset as u64;
        let mut size = size;
        if file.opts.circular && size > file.opts.max_size {
            offset += size - file.opts.max_size;
            size = file.opts.max_size;
        }
        if size == 0 {
            return Ok((offset as i64, Vec::new()));
        }

        let fetch_plan = partition_range(&file, offset, size);
        let mut indices: Vec<PartIdx> = fetch_plan.iter().map(|r| r.part_idx).collect();
        indices.sort_unstable();
        indices.dedup();
        let backend_parts = self.backend.get_parts(namespace_id, name, &indices).await?;

        let inner = self.inner.lock();
        let entry = inner.entries.get(&key);
        let live_size = entry
            .and_then(|e| e.file_buffer())
            .map(|fb| fb.file().size)
            .unwrap_or(file.size);
        let clamped_size = (live_size.saturating_sub(offset)).min(size);

        let mut out = Vec::with_capacity(clamped_size as usize);
        for range in partition_range(&file, offset, clamped_size) {
            let part_bytes: Bytes = entry
                .and_then(|e| e.part(range.part_idx))
                .map(|p| p.data().clone())
                .or_else(|| backend_parts.get(&range.part_idx).cloned())
                .unwrap_or_else(|| Bytes::from(vec![0u8; crate::parts::PART_SIZE as usize]));

            let start = range.offset_in_part as usize;
            if start >= part_bytes.len() {
                out.extend(std::iter::repeat(0u8).take(range.len as usize));
                continue;
            }
            let end = (start + range.len as usize).min(part_bytes.len());
            out.extend_from_slice(&part_bytes[start..end]);
            let got = (end - start) as u64;
            if got < range.len {
                out.extend(std::iter::repeat(0u8).take((range.len - got) as usize));
            }
        }
        Ok((offset as i64, out))
    }

    /// `ReadAt(0, file.size)` with a prior `Stat`.
    pub async fn read_file(&self, namespace_id: &str, name: &str) -> CacheResult<Vec<u8>> {
        let file = self.stat(namespace_id, name).await?;
        let (_, bytes) = self.read_at(namespace_id, name, 0, file.size).await?;
        Ok(bytes)
    }

    // ---- §4.9 flusher ----------------------------------------------------------

    /// Run the flush protocol on every currently-known entry, synchronously.
    pub async fn flush_cache(&self) -> CacheResult<()> {
        let keys: Vec<FileKey> = {
            let inner = self.inner.lock();
            inner.entries.keys().cloned().collect()
        };
        for key in keys {
            self.flush_one(&key).await;
        }
        Ok(())
    }

    /// Flush a single entry: select dirty buffers under the lock, mark
    /// them flushing, release the lock, write to the backing store, then
    /// clear dirty then flushing on success.
    async fn flush_one(&self, key: &FileKey) {
        let selected = {
            let mut inner = self.inner.lock();
            let entry = match inner.entries.get(key) {
                None => return,
                Some(entry) => entry,
            };
            if entry.is_deleted() || entry.file_buffer().is_none() {
                Self::try_delete_locked(&mut inner, key);
                return;
            }
            let entry = inner.entries.get(key).expect("checked above");
            let file_buf = entry.file_buffer().filter(|fb| fb.is_dirty()).cloned();
            let dirty_parts: Vec<Arc<PartBuffer>> =
                entry.loaded_parts().filter(|p| p.is_dirty()).cloned().collect();
            if file_buf.is_none() && dirty_parts.is_empty() {
                Self::try_delete_locked(&mut inner, key);
                return;
            }
            if let Some(fb) = &file_buf {
                begin_flush_file(fb);
            }
            for p in &dirty_parts {
                begin_flush_part(p);
            }
            (file_buf, dirty_parts)
        };

        let (file_buf, dirty_parts) = selected;
        let file_for_write = file_buf.as_ref().map(|fb| fb.file().clone());
        let parts_for_write: Vec<(PartIdx, Bytes)> = dirty_parts
            .iter()
            .map(|p| (p.part_idx, p.data().clone()))
            .collect();

        let result = self
            .backend
            .write_cache_entry(&key.namespace_id, &key.name, file_for_write.as_ref(), &parts_for_write)
            .await;

        match result {
            Ok(()) => {
                if let Some(fb) = &file_buf {
                    complete_flush_file(fb);
                }
                for p in &dirty_parts {
                    complete_flush_part(p);
                }
                // Re-check the entry's *current* buffers under the lock
                // rather than trusting the snapshot we just flushed: a
                // concurrent write may have COW-replaced a selected slot
                // with a fresh dirty buffer while the backend write was
                // in flight, and that buffer must survive to be picked
                // up by the next flush pass rather than be evicted here.
                let mut inner = self.inner.lock();
                Self::try_delete_if_clean_locked(&mut inner, key);
            }
            Err(e) => {
                warn!(
                    namespace_id = %key.namespace_id,
                    name = %key.name,
                    error = %e,
                    "flush failed, will retry next pass"
                );
            }
        }
    }
}

/// Circular-file write-window trimming: a write entirely
/// before `size - maxSize` is dropped (`None`); a write straddling the
/// boundary has its leading out-of-window bytes discarded.
fn trim_for_circular_window<'a>(
    file: &File,
    offset: u64,
    data: &'a [u8],
) -> Option<(u64, &'a [u8])> {
    if !file.opts.circular {
        return Some((offset, data));
    }
    let start = file.size as i64 - file.opts.max_size as i64;
    let write_end = offset as i64 + data.len() as i64;
    if write_end <= start {
        return None;
    }
    if (offset as i64) < start {
        let discard = (start - offset as i64) as usize;
        Some((start as u64, &data[discard..]))
    } else {
        Some((offset, data))
    }
}
