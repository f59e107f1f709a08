//! Error types for queue directory access.

use std::io;

use thiserror::Error;

use crate::{QueueArea, QueueId};

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid queue id {0:?}")]
    InvalidQueueId(String),

    /// A record that cannot be parsed at all.
    #[error("bad record at offset {offset}: {detail}")]
    Record { offset: u64, detail: String },

    /// The file parsed, but is missing something every envelope must have.
    #[error("{queue_id}: corrupt envelope: {detail}")]
    Corrupt { queue_id: QueueId, detail: String },

    #[error("queue file {queue_id} not found in {area}")]
    NotFound { area: QueueArea, queue_id: QueueId },

    #[error("queue directory validation failed: {0}")]
    Validation(String),
}

impl SpoolError {
    /// Whether the underlying cause is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            Self::NotFound { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SpoolError>;
