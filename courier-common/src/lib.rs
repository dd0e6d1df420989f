//! Pieces shared by every courier crate: the shutdown signal and logging.

pub mod logging;

pub use tracing;

/// Broadcast to every long-running task when the process is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop taking new work and finish what is in flight.
    Shutdown,
    /// Everything has been drained; tasks should exit immediately.
    Finalised,
}
