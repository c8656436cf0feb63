//! Partition arithmetic: mapping byte ranges of a file onto fixed-size
//! parts, including the wrap-around arithmetic of circular files.
//!
//! Generalizes `objectio-block`'s `ChunkMapper` (byte offset / byte range
//! to fixed-size chunk) with the wrap-around a circular file needs: a
//! part index is always taken modulo the file's circular window, so
//! writes past `maxSize` land back on an earlier physical part instead
//! of growing the part table without bound.

use std::collections::BTreeMap;

use crate::file::File;

/// Process-wide part size. Every `PartBuffer` holds at most this many bytes.
pub const PART_SIZE: u64 = 64 * 1024;

/// Sentinel used where "no part" needs to be represented as a value
/// rather than an `Option` (mirrors the source's `NoPartIdx`).
pub const NO_PART_IDX: i64 = -1;

/// Index of a part within a file, after any circular wrap has been applied.
pub type PartIdx = u64;

/// Round `size` up to the next multiple of [`PART_SIZE`]. Used by
/// `MakeFile` to normalize a circular file's `maxSize`.
pub fn round_up_to_part_size(size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    size.div_ceil(PART_SIZE) * PART_SIZE
}

/// Number of physical parts in a circular file's retained window.
/// `max_size` is assumed already rounded up to a multiple of [`PART_SIZE`].
pub fn circular_window_parts(max_size: u64) -> u64 {
    max_size / PART_SIZE
}

/// One contiguous slice of a write or read, addressed to a physical part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// Physical part index (already wrapped for circular files).
    pub part_idx: PartIdx,
    /// Byte offset within that part.
    pub offset_in_part: u64,
    /// Number of bytes of this slice.
    pub len: u64,
}

/// `floor(off / PartSize)`, wrapped modulo the circular window for
/// circular files.
pub fn part_idx_at_offset(file: &File, off: u64) -> PartIdx {
    let raw = off / PART_SIZE;
    if file.opts.circular {
        raw % circular_window_parts(file.opts.max_size)
    } else {
        raw
    }
}

/// The part containing `file.size - 1`, if that part is not completely
/// full. `None` if the file is
/// empty or its size lands exactly on a part boundary.
pub fn last_incomplete_part(file: &File) -> Option<PartIdx> {
    if file.size == 0 || file.size % PART_SIZE == 0 {
        return None;
    }
    Some(part_idx_at_offset(file, file.size - 1))
}

/// Split the half-open byte range `[start_off, start_off + len)` into
/// per-part slices, wrapping part indices for circular files. Used for
/// both planning a write and for slicing a read into per-part fetches.
pub fn partition_range(file: &File, start_off: u64, len: u64) -> Vec<PartRange> {
    if len == 0 {
        return Vec::new();
    }
    let end = start_off + len;
    let mut out = Vec::new();
    let mut pos = start_off;
    while pos < end {
        let raw_part = pos / PART_SIZE;
        let offset_in_part = pos % PART_SIZE;
        let part_end = (raw_part + 1) * PART_SIZE;
        let slice_len = part_end.min(end) - pos;
        let part_idx = if file.opts.circular {
            raw_part % circular_window_parts(file.opts.max_size)
        } else {
            raw_part
        };
        out.push(PartRange {
            part_idx,
            offset_in_part,
            len: slice_len,
        });
        pos += slice_len;
    }
    out
}

/// The number of bytes a write of `len` bytes starting at `start_off`
/// would place into each touched part. For a circular file whose write
/// wraps, the same physical part
/// may be touched more than once; the counts are summed so "incomplete"
/// reflects the true planned occupancy.
pub fn compute_part_map(file: &File, start_off: u64, len: u64) -> BTreeMap<PartIdx, u64> {
    let mut map = BTreeMap::new();
    for range in partition_range(file, start_off, len) {
        *map.entry(range.part_idx).or_insert(0) += range.len;
    }
    map
}

/// Parts from [`compute_part_map`] whose planned byte count is less than
/// [`PART_SIZE`] — these are the only parts a write needs to load before
/// mutating, since a complete write fully overwrites the part.
pub fn incomplete_parts(file: &File, start_off: u64, len: u64) -> Vec<PartIdx> {
    compute_part_map(file, start_off, len)
        .into_iter()
        .filter(|&(_, planned)| planned < PART_SIZE)
        .map(|(idx, _)| idx)
        .collect()
}
