use thiserror::Error;
use super::types::{UploadId, UploadStatus};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Upload {0} not found")]
    EntryNotFound(UploadId),

    #[error("Invalid transition for upload {id}: {from} -> {to}")]
    InvalidTransition {
        id: UploadId,
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_transition(id: UploadId, from: UploadStatus, to: UploadStatus) -> Self {
        Self::InvalidTransition { id, from, to }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Error alias
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
