//! Makes it ergonomic to run blocking work (spawning subprocesses, walking large directory trees)
//! from an async task without stalling the scheduler the task runs on.
//!
//! [`tokio::run_blocking_task`] offloads a single closure to tokio's blocking threads.
//! [`BlockingPool`] does the same but bounds how many closures run at once, which is what long
//! running services want when many requests may offload work at the same time.

mod pool;
pub mod tokio;

pub use pool::BlockingPool;

/// A marker type that is used to signal that a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "the blocking task was cancelled")
    }
}

impl std::error::Error for Cancelled {}
