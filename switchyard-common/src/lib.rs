pub mod address;
pub mod dsn;
pub mod duration;
pub mod logging;

pub use dsn::{Dsn, DsnClass};
pub use tracing;

/// Lifecycle notifications broadcast to every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
