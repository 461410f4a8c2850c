//! Bounded-concurrency FIFO dispatch for provider calls.
//!
//! A single dispatcher task owns the pending list; submissions arrive over a
//! channel and a semaphore caps how many tasks run at once. Nothing outside
//! this module touches the queue state directly.

mod queue;
mod stats;

pub use queue::{QueueConfig, TaskError, TaskHandle, TaskQueue};
pub use stats::QueueSnapshot;
