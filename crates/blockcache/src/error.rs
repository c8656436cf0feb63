//! Cache error types

use thiserror::Error;

/// Error returned by a [`crate::BlockStore`] operation.
#[derive(Error, Debug)]
pub enum CacheError {
    /// `MakeFile` was called for a namespace/name that already has a live
    /// (non-deleted) file.
    #[error("file already exists: {namespace_id}/{name}")]
    FileExists { namespace_id: String, name: String },

    /// The entry is deleted but still referenced by pins or write
    /// intentions, so the slot cannot be reused yet.
    #[error("file busy: {namespace_id}/{name}")]
    FileBusy { namespace_id: String, name: String },

    /// Neither the cache nor the backing store has this file.
    #[error("file not found: {namespace_id}/{name}")]
    NotFound { namespace_id: String, name: String },

    /// The file was deleted by a concurrent caller while this operation
    /// was in flight.
    #[error("file deleted: {namespace_id}/{name}")]
    FileDeleted { namespace_id: String, name: String },

    /// Caller-supplied argument violates an invariant (negative offset,
    /// offset past end, invalid `FileOpts`, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing store returned an error. `step` names the operation
    /// that failed (e.g. `"insertFile"`, `"getParts"`).
    #[error("backend error during {step}: {source}")]
    Backend {
        step: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CacheError {
    /// Wrap a backing-store error, naming the step that failed.
    pub fn backend(
        step: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CacheError::Backend {
            step,
            source: Box::new(source),
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
