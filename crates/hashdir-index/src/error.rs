//! Error types for the index crate.

use std::path::PathBuf;

use hashdir_store::StoreError;

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The object is not present in the index.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// On-disk state contradicts the naming invariants.
    #[error("index corruption at {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    /// Every disambiguation candidate up to the probe cap is taken.
    #[error("collision chain in {dir} exceeds {probes} candidates")]
    ResourceExhausted { dir: String, probes: u32 },

    /// The direct encoding of an identity exceeds the absolute name limit.
    #[error("encoded name is {len} bytes, limit is {max}")]
    NameTooLong { len: usize, max: usize },

    /// Synthetic failure raised by failure injection. Only the retry
    /// harness observes this.
    #[error("injected failure at point {point}")]
    InjectedFailure { point: u64 },

    /// The request cannot apply to its target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Source and destination indexes do not share one backend.
    #[error("indexes live on different backends")]
    BackendMismatch,

    /// Filesystem error the index cannot interpret.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl IndexError {
    /// Returns `true` for the synthetic failure-injection signal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::InjectedFailure { .. })
    }
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
