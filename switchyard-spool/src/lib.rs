//! Queue directory access for the switchyard queue manager.
//!
//! A queue directory holds one subdirectory per [`QueueArea`]. Message files
//! are named by [`QueueId`] and contain line-oriented envelope records
//! ([`record`]) around the raw message content.

pub mod area;
pub mod envelope;
pub mod error;
pub mod lock;
pub mod logfile;
pub mod queue_id;
pub mod record;
pub mod scan;
pub mod store;
pub mod writer;

pub use area::QueueArea;
pub use envelope::{EnvelopeReader, mark_done};
pub use error::{Result, SpoolError};
pub use logfile::{LogEntry, LogFiles};
pub use queue_id::QueueId;
pub use record::{Record, SizeRecord};
pub use scan::ScanDir;
pub use store::{OpenCheck, QueueStore};
pub use writer::EnvelopeWriter;
