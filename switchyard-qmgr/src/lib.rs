//! Delivery scheduler for the switchyard queue manager.
//!
//! The scheduler moves queue files from the incoming and deferred areas into
//! the active area, groups their recipients by transport and destination, and
//! hands recipient batches to delivery agents under per-destination
//! concurrency windows:
//! - Messages are read in bounded passes so huge recipient lists never sit in
//!   core all at once
//! - Jobs of one transport preempt each other so small messages are not stuck
//!   behind large ones
//! - Destinations slow down or stop after failures and recover on success
//! - Finished messages are removed, deferred with a backoff, or returned to
//!   their sender
//!
//! [`QueueManager`] is the synchronous core; [`scheduler::Scheduler`] drives
//! it with timers, trigger requests and delivery agent connections.

mod active;
pub mod agent;
mod arena;
pub mod bounce;
pub mod clock;
pub mod config;
mod defer;
mod deliver;
mod destination;
mod entry;
mod error;
mod feedback;
pub mod flow;
mod job;
mod manager;
mod message;
mod peer;
mod recipient;
pub mod resolve;
mod scan;
pub mod scheduler;
mod timer;
mod transport;
mod trigger;

#[cfg(test)]
mod testing;

pub use arena::{MessageId, SessionId, TransportId};
pub use config::{ConfigError, QmgrConfig};
pub use deliver::Session;
pub use error::QmgrError;
pub use manager::{Action, Pace, QueueManager, QueueStats};
pub use scan::ScanFlags;
pub use trigger::Trigger;
