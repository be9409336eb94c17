use std::path::PathBuf;

/// Errors surfaced by the task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record's file lock could not be acquired within the timeout.
    #[error("could not acquire lock on {path}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid task record {path}: {source}")]
    InvalidRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this is a lock-acquisition failure.
    #[must_use]
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Self::Lock { .. })
    }
}
