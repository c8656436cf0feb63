//! `CacheEntry`: the per-(namespace, name) record held by [`crate::BlockStore`].
//!
//! Generalizes `objectio-block`'s `VolumeCache` (`cache.rs`) — which only
//! tracked dirty/clean chunk maps — with a pin count, deleted flag and
//! write-intention registry to gate eviction while a multi-step
//! operation (or the flusher) is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{FileBuffer, PartBuffer};
use crate::parts::PartIdx;

/// Monotonically increasing id returned by `registerIntention`.
pub type IntentionId = u64;

/// A pending or in-flight write, recorded so the entry cannot be evicted
/// mid-operation and so a future conflict-detecting coordinator has
/// something to look at.
#[derive(Debug, Clone)]
pub enum WriteIntention {
    /// An `AppendData` in flight.
    Append,
    /// A `WriteFile` (whole-file replace) in flight.
    Replace,
    /// A `WriteAt` in flight, carrying the planned per-part byte counts
    /// from `computePartMap`.
    Partial(std::collections::BTreeMap<PartIdx, u64>),
}

/// The per-(namespace, name) cache record.
pub struct CacheEntry {
    pub namespace_id: String,
    pub name: String,
    pin_count: u32,
    deleted: bool,
    write_intentions: HashMap<IntentionId, WriteIntention>,
    file_buffer: Option<Arc<FileBuffer>>,
    data_parts: Vec<Option<Arc<PartBuffer>>>,
}

impl CacheEntry {
    pub fn new(namespace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
            pin_count: 0,
            deleted: false,
            write_intentions: HashMap::new(),
            file_buffer: None,
            data_parts: Vec::new(),
        }
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    /// Returns `false` (and logs a warning at the call site) if the count
    /// was already zero — a caller-invariant check, not a hard error.
    pub fn unpin(&mut self) -> bool {
        if self.pin_count == 0 {
            return false;
        }
        self.pin_count -= 1;
        true
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn add_intention(&mut self, id: IntentionId, intention: WriteIntention) {
        self.write_intentions.insert(id, intention);
    }

    /// Returns `false` if the id was not present (caller-invariant warning).
    pub fn remove_intention(&mut self, id: IntentionId) -> bool {
        self.write_intentions.remove(&id).is_some()
    }

    pub fn has_intentions(&self) -> bool {
        !self.write_intentions.is_empty()
    }

    /// An entry may be removed from the registry only when unpinned and
    /// free of intentions.
    pub fn is_evictable(&self) -> bool {
        self.pin_count == 0 && self.write_intentions.is_empty()
    }

    /// Whether the file buffer or any loaded part is currently dirty.
    /// A flusher must never evict an entry that still has dirty state —
    /// a post-flush snapshot taken against stale `Arc` clones can miss a
    /// concurrent COW write that swapped in a fresh dirty buffer after
    /// the flush's own selection was made.
    pub fn has_dirty_buffers(&self) -> bool {
        if self.file_buffer.as_ref().is_some_and(|fb| fb.is_dirty()) {
            return true;
        }
        self.loaded_parts().any(|p| p.is_dirty())
    }

    pub fn file_buffer(&self) -> Option<&Arc<FileBuffer>> {
        self.file_buffer.as_ref()
    }

    pub fn set_file_buffer(&mut self, buf: Arc<FileBuffer>) {
        self.file_buffer = Some(buf);
    }

    pub fn file_buffer_mut_slot(&mut self) -> &mut Option<Arc<FileBuffer>> {
        &mut self.file_buffer
    }

    pub fn part(&self, idx: PartIdx) -> Option<&Arc<PartBuffer>> {
        self.data_parts.get(idx as usize).and_then(|slot| slot.as_ref())
    }

    /// Grow `data_parts` so index `idx` is addressable.
    fn ensure_len(&mut self, idx: PartIdx) {
        let needed = idx as usize + 1;
        if self.data_parts.len() < needed {
            self.data_parts.resize_with(needed, || None);
        }
    }

    /// Slot for `idx`, growing the sparse vector if needed. Used by the
    /// write path, which always installs a buffer at this index.
    pub fn part_slot_mut(&mut self, idx: PartIdx) -> &mut Option<Arc<PartBuffer>> {
        self.ensure_len(idx);
        &mut self.data_parts[idx as usize]
    }

    /// Grow the sparse part vector to cover `idx` without installing
    /// anything there. `loadDataParts` calls this before its
    /// first-writer-wins install loop so the vector's length reflects
    /// every index it was asked for, not just the ones the backing store
    /// actually had data for.
    pub fn ensure_capacity(&mut self, idx: PartIdx) {
        self.ensure_len(idx);
    }

    /// Install `buf` at `idx` only if that slot is currently empty — the
    /// load path's "first writer wins" rule, so an in-flight dirty write
    /// is never clobbered by a slower concurrent load of the same part.
    pub fn install_loaded_part_if_absent(&mut self, idx: PartIdx, buf: Arc<PartBuffer>) {
        self.ensure_len(idx);
        let slot = &mut self.data_parts[idx as usize];
        if slot.is_none() {
            *slot = Some(buf);
        }
    }

    /// Drop every loaded part — used by `WriteFile`, which replaces the
    /// whole payload.
    pub fn clear_parts(&mut self) {
        self.data_parts.clear();
    }

    /// All currently loaded parts, dirty or not.
    pub fn loaded_parts(&self) -> impl Iterator<Item = &Arc<PartBuffer>> {
        self.data_parts.iter().filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::buffer::PartBuffer;

    #[test]
    fn pin_unpin_tracks_count() {
        let mut e = CacheEntry::new("ns", "f");
        assert!(e.is_evictable());
        e.pin();
        e.pin();
        assert_eq!(e.pin_count(), 2);
        assert!(!e.is_evictable());
        assert!(e.unpin());
        assert!(e.unpin());
        assert_eq!(e.pin_count(), 0);
        assert!(e.is_evictable());
    }

    #[test]
    fn unpin_below_zero_reports_false() {
        let mut e = CacheEntry::new("ns", "f");
        assert!(!e.unpin());
    }

    #[test]
    fn intentions_gate_evictability() {
        let mut e = CacheEntry::new("ns", "f");
        e.add_intention(1, WriteIntention::Append);
        assert!(!e.is_evictable());
        assert!(e.remove_intention(1));
        assert!(e.is_evictable());
        assert!(!e.remove_intention(1));
    }

    #[test]
    fn install_loaded_part_if_absent_keeps_first_writer() {
        let mut e = CacheEntry::new("ns", "f");
        e.install_loaded_part_if_absent(2, Arc::new(PartBuffer::new(2, Bytes::from_static(b"a"))));
        e.install_loaded_part_if_absent(2, Arc::new(PartBuffer::new(2, Bytes::from_static(b"b"))));
        assert_eq!(e.part(2).unwrap().data().as_ref(), b"a");
        assert!(e.part(0).is_none());
        assert!(e.part(5).is_none());
    }

    #[test]
    fn has_dirty_buffers_false_until_a_write_lands() {
        let mut e = CacheEntry::new("ns", "f");
        assert!(!e.has_dirty_buffers());
        e.install_loaded_part_if_absent(0, Arc::new(PartBuffer::new(0, Bytes::from_static(b"clean"))));
        assert!(!e.has_dirty_buffers());

        let slot = e.part_slot_mut(0);
        crate::buffer::cow_write_part(slot, 0, b"dirty");
        assert!(e.has_dirty_buffers());
    }

    #[test]
    fn has_dirty_buffers_true_after_file_buffer_write() {
        use crate::buffer::{cow_write_file, install_clean_file};
        use crate::file::{File, FileOpts};

        let mut e = CacheEntry::new("ns", "f");
        e.set_file_buffer(install_clean_file(File {
            namespace_id: "ns".into(),
            name: "f".into(),
            opts: FileOpts {
                max_size: 0,
                circular: false,
                ijson: false,
            },
            created_ts: 0,
            mod_ts: 0,
            size: 0,
            meta: Default::default(),
        }));
        assert!(!e.has_dirty_buffers());
        cow_write_file(e.file_buffer_mut_slot().as_mut().unwrap(), |f| f.size = 5);
        assert!(e.has_dirty_buffers());
    }

    #[test]
    fn clear_parts_drops_everything() {
        let mut e = CacheEntry::new("ns", "f");
        e.install_loaded_part_if_absent(0, Arc::new(PartBuffer::new(0, Bytes::new())));
        e.clear_parts();
        assert!(e.part(0).is_none());
    }
}
