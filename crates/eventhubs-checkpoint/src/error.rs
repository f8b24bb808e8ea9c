//! Checkpoint Store Error Types
//!
//! ## Error Categories
//!
//! ### Storage Errors
//! - `ObjectStore`: the backing object store failed (network, auth, throttling, ...)
//!
//! ### Data Errors
//! - `MalformedRecord`: a stored ownership or checkpoint is missing a required
//!   field or carries a value that doesn't parse
//! - `InvalidArgument`: a caller passed a record that can't be addressed
//!   (empty namespace, hub, consumer group or partition id)
//!
//! Losing an ownership race is NOT an error. Contention is reported per item
//! through [`ClaimOutcome::Lost`](crate::ClaimOutcome::Lost).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointStoreError>;

#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Malformed record at {path}: {reason}")]
    MalformedRecord { path: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CheckpointStoreError {
    pub(crate) fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CheckpointStoreError::MalformedRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
