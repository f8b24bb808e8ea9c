//! Error types for the Event Hubs processor

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor already running")]
    AlreadyRunning,

    #[error("Processor is still running, stop it before closing")]
    StillRunning,

    #[error("Processor closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid checkpoint for partition {partition_id}: no offset or sequence number")]
    InvalidCheckpoint { partition_id: String },

    #[error("Event hub error: {0}")]
    EventHub(String),

    #[error("Checkpoint store error: {0}")]
    Store(#[from] eventhubs_checkpoint::CheckpointStoreError),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ProcessorError {
    /// Errors that end the processing loop instead of failing a single cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::Configuration(_))
    }
}
