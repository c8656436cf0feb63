//! `PartBuffer` and `FileBuffer`: the two buffer kinds the cache mutates
//! copy-on-write, coordinated with the flusher via a pair of atomic
//! flags.
//!
//! Mirrors `objectio-block`'s `DirtyChunk` (`cache.rs`), generalized from
//! "one dirty flag implied by map membership" to two independent
//! `dirty`/`flushing` flags, since reads must keep being served from a
//! buffer that is mid-flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::file::File;
use crate::parts::PartIdx;

/// A fixed-size region of a file's payload.
#[derive(Debug)]
pub struct PartBuffer {
    pub part_idx: PartIdx,
    data: Bytes,
    dirty: AtomicBool,
    flushing: AtomicBool,
}

impl PartBuffer {
    pub fn new(part_idx: PartIdx, data: Bytes) -> Self {
        Self {
            part_idx,
            data,
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    fn set_dirty(&self, value: bool) {
        self.dirty.store(value, Ordering::Release);
    }

    fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::Release);
    }
}

/// The mutable metadata image of a file, carrying the same dirty/flushing
/// discipline as a `PartBuffer`.
#[derive(Debug)]
pub struct FileBuffer {
    file: File,
    dirty: AtomicBool,
    flushing: AtomicBool,
}

impl FileBuffer {
    pub fn new(file: File) -> Self {
        Self {
            file,
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    fn set_dirty(&self, value: bool) {
        self.dirty.store(value, Ordering::Release);
    }

    fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::Release);
    }
}

/// Write `patch` into `slot` at `offset_in_part`, extending the part up
/// to `PartSize`. The mutation always produces a fresh `PartBuffer` built
/// from the old one's bytes and swaps it into the slot, so a reader that
/// grabbed an `Arc` clone while the old buffer was `flushing` keeps
/// observing the old, untouched bytes.
pub fn cow_write_part(slot: &mut Arc<PartBuffer>, offset_in_part: u64, patch: &[u8]) {
    // Whether we're cloning-on-write or mutating an already-exclusive
    // buffer, the result is a freshly built `PartBuffer` swapped into the
    // slot; the distinction that matters is which buffer's bytes seed it.
    let offset_in_part = offset_in_part as usize;
    let needed_len = offset_in_part + patch.len();
    let mut bytes = slot.data.to_vec();
    if bytes.len() < needed_len {
        bytes.resize(needed_len, 0);
    }
    bytes[offset_in_part..needed_len].copy_from_slice(patch);
    let new_buf = PartBuffer::new(slot.part_idx, Bytes::from(bytes));
    new_buf.set_dirty(true);
    *slot = Arc::new(new_buf);
}

/// Install `data` as a freshly loaded part, never marked dirty.
pub fn loaded_part(part_idx: PartIdx, data: Bytes) -> Arc<PartBuffer> {
    Arc::new(PartBuffer::new(part_idx, data))
}

/// Mutate the file descriptor in `slot` through `mutate`, following the
/// same copy-on-write rule as [`cow_write_part`].
pub fn cow_write_file<R>(
    slot: &mut Arc<FileBuffer>,
    mutate: impl FnOnce(&mut File) -> R,
) -> R {
    let mut file = slot.file.clone();
    let result = mutate(&mut file);
    let new_buf = FileBuffer::new(file);
    new_buf.set_dirty(true);
    *slot = Arc::new(new_buf);
    result
}

/// Install a freshly loaded `FileBuffer` without going through the
/// copy-on-write path — used when installing a just-fetched,
/// not-yet-mutated descriptor.
pub fn install_clean_file(file: File) -> Arc<FileBuffer> {
    Arc::new(FileBuffer::new(file))
}

/// Mark a buffer as selected for flushing. Must be called under the
/// store lock, before the lock is released for the backing-store write.
pub fn begin_flush_part(buf: &Arc<PartBuffer>) {
    buf.set_flushing(true);
}

pub fn begin_flush_file(buf: &Arc<FileBuffer>) {
    buf.set_flushing(true);
}

/// Clear `dirty` then `flushing`, in that order, on flush success.
pub fn complete_flush_part(buf: &Arc<PartBuffer>) {
    buf.set_dirty(false);
    buf.set_flushing(false);
}

pub fn complete_flush_file(buf: &Arc<FileBuffer>) {
    buf.set_dirty(false);
    buf.set_flushing(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileOpts;

    fn test_file() -> File {
        File {
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
        }
    }

    #[test]
    fn cow_write_part_writes_in_place_when_not_flushing() {
        let mut slot = Arc::new(PartBuffer::new(0, Bytes::new()));
        cow_write_part(&mut slot, 0, b"hello");
        assert_eq!(slot.data().as_ref(), b"hello");
        assert!(slot.is_dirty());
    }

    #[test]
    fn cow_write_part_clones_when_flushing() {
        let buf = PartBuffer::new(0, Bytes::from_static(b"abcde"));
        buf.set_dirty(true);
        buf.set_flushing(true);
        let mut slot = Arc::new(buf);
        let original = Arc::clone(&slot);

        cow_write_part(&mut slot, 2, b"XY");

        // original is untouched
        assert_eq!(original.data().as_ref(), b"abcde");
        assert!(original.is_flushing());
        // new slot reflects the write and is dirty but not flushing
        assert_eq!(slot.data().as_ref(), b"abXYe");
        assert!(slot.is_dirty());
        assert!(!slot.is_flushing());
    }

    #[test]
    fn flush_lifecycle_clears_dirty_then_flushing() {
        let mut slot = Arc::new(PartBuffer::new(0, Bytes::new()));
        cow_write_part(&mut slot, 0, b"x");
        begin_flush_part(&slot);
        assert!(slot.is_dirty());
        assert!(slot.is_flushing());
        complete_flush_part(&slot);
        assert!(!slot.is_dirty());
        assert!(!slot.is_flushing());
    }

    #[test]
    fn cow_write_file_clones_when_flushing() {
        let buf = FileBuffer::new(test_file());
        buf.set_flushing(true);
        let mut slot = Arc::new(buf);
        let original = Arc::clone(&slot);

        cow_write_file(&mut slot, |f| f.size = 10);

        assert_eq!(original.file().size, 0);
        assert_eq!(slot.file().size, 10);
        assert!(slot.is_dirty());
        assert!(!slot.is_flushing());
    }
}
