//! File descriptor: the durable metadata image of a block file.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{CacheError, CacheResult};
use crate::parts::round_up_to_part_size;

/// Options fixed at file creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOpts {
    /// Maximum retained size in bytes. For circular files this is the
    /// size of the retained window; for non-circular files `0` means
    /// unbounded.
    pub max_size: u64,
    /// Circular files retain only the most recent `max_size` bytes;
    /// `size` keeps growing but the payload wraps.
    pub circular: bool,
    /// Whether the file's contents are line-delimited JSON. Mutually
    /// exclusive with `circular`.
    pub ijson: bool,
}

impl FileOpts {
    /// Validate and normalize options the way `MakeFile` requires
    ///: negative sizes are rejected by the caller before
    /// this point (the field is unsigned), circular files must have a
    /// positive `max_size` rounded up to a `PartSize` multiple, and
    /// circular + ijson is forbidden.
    pub fn normalized(mut self) -> CacheResult<Self> {
        if self.circular && self.ijson {
            return Err(CacheError::InvalidArgument(
                "circular files cannot also be ijson".into(),
            ));
        }
        if self.circular {
            if self.max_size == 0 {
                return Err(CacheError::InvalidArgument(
                    "circular files require max_size > 0".into(),
                ));
            }
            self.max_size = round_up_to_part_size(self.max_size);
        }
        Ok(self)
    }
}

/// Identifies a file uniquely: unique `name` within an opaque `namespace_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    pub namespace_id: String,
    pub name: String,
}

impl FileKey {
    pub fn new(namespace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
        }
    }
}

/// The file descriptor itself: immutable identity/opts, mutable
/// size/mod-time/meta.
#[derive(Debug, Clone)]
pub struct File {
    pub namespace_id: String,
    pub name: String,
    pub opts: FileOpts,
    pub created_ts: i64,
    pub mod_ts: i64,
    /// Ever-growing logical size; for circular files this counts all
    /// bytes ever appended, not the retained window.
    pub size: u64,
    pub meta: HashMap<String, Value>,
}

impl File {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.namespace_id.clone(), self.name.clone())
    }

    /// Merge or replace `meta`: merging applies a `null` value as
    /// "delete this top-level key", any other value as "assign";
    /// replacing swaps the whole map.
    pub fn apply_meta(&mut self, patch: HashMap<String, Value>, merge: bool) {
        if !merge {
            self.meta = patch;
            return;
        }
        for (k, v) in patch {
            if v.is_null() {
                self.meta.remove(&k);
            } else {
                self.meta.insert(k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_rounds_circular_max_size() {
        let opts = FileOpts {
            max_size: 1,
            circular: true,
            ijson: false,
        }
        .normalized()
        .unwrap();
        assert_eq!(opts.max_size, crate::parts::PART_SIZE);
    }

    #[test]
    fn normalized_rejects_circular_ijson() {
        let err = FileOpts {
            max_size: 10,
            circular: true,
            ijson: true,
        }
        .normalized();
        assert!(err.is_err());
    }

    #[test]
    fn normalized_rejects_zero_max_size_circular() {
        let err = FileOpts {
            max_size: 0,
            circular: true,
            ijson: false,
        }
        .normalized();
        assert!(err.is_err());
    }

    #[test]
    fn apply_meta_merge_deletes_null_and_assigns_others() {
        let mut f = File {
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
            meta: HashMap::from([
                ("k2".to_string(), Value::String("v".into())),
                ("k3".to_string(), Value::from(3)),
            ]),
        };
        let patch = HashMap::from([
            ("k1".to_string(), Value::from(1)),
            ("k2".to_string(), Value::Null),
        ]);
        f.apply_meta(patch, true);
        assert_eq!(f.meta.get("k1"), Some(&Value::from(1)));
        assert_eq!(f.meta.get("k2"), None);
        assert_eq!(f.meta.get("k3"), Some(&Value::from(3)));
    }
}
