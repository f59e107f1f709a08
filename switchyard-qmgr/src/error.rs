//! Conditions that stop the scheduler.
//!
//! Everything recoverable (a corrupt file, a locked file, a dead destination,
//! a crashed delivery agent) is handled in place and logged. What reaches a
//! caller as a [`QmgrError`] means the in-core state can no longer be trusted
//! to match the queue directory, and the process should exit.

use switchyard_spool::{QueueArea, QueueId, SpoolError};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum QmgrError {
    /// A queue file operation that must succeed did not.
    #[error("{op} {queue_id}: {source}")]
    Storage {
        op: &'static str,
        queue_id: QueueId,
        #[source]
        source: SpoolError,
    },

    /// A queue area could not be listed.
    #[error("scan {area} queue: {source}")]
    Scan {
        area: QueueArea,
        #[source]
        source: SpoolError,
    },

    /// A delivery agent never answered.
    #[error("timeout receiving delivery status from transport {transport} for {queue_id}")]
    Watchdog { transport: String, queue_id: QueueId },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QmgrError {
    /// Map a failed queue file operation into a fatal error.
    pub(crate) fn storage<E: Into<SpoolError>>(op: &'static str, queue_id: QueueId) -> impl FnOnce(E) -> Self {
        move |source| Self::Storage {
            op,
            queue_id,
            source: source.into(),
        }
    }
}
