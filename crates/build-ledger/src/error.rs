//! Error types for build-ledger

use thiserror::Error;

/// Errors produced by an event log or provenance store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend refused the write (connection lost, constraint violated, ...)
    #[error("save rejected: {reason}")]
    SaveRejected { reason: String },

    /// The build no longer exists (reaped while a step was still running)
    #[error("build not found: {build_id}")]
    BuildNotFound { build_id: String },

    /// Payload could not be encoded for persistence
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
