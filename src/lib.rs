//! Provider-mediation core for the Inkra serialized-fiction pipeline.
//!
//! Everything that touches a rate-limited generative-text provider goes
//! through this crate: a bounded-concurrency FIFO dispatcher, a TTL + LRU
//! response cache keyed by request fingerprint, a provider-aware retry
//! executor, a size/time batch accumulator, and the bounded-memory utilities
//! shared by long-running generation loops.
//!
//! The crate is an in-process library. Prompt construction, narrative logic,
//! and chapter persistence live in the embedding application and interact
//! with this core only through [`pipeline::GenerationCore`] and the component
//! APIs re-exported below.
#![warn(rust_2018_idioms)]
#![allow(
    clippy::cast_precision_loss, // Acceptable for ratios/display
    clippy::must_use_candidate,  // Annotated selectively on critical APIs
    clippy::missing_errors_doc   // Internal API
)]

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod memory;
pub mod pipeline;
pub mod provider;
pub mod retry;

// Re-export main types for easy access
pub use batch::{BatchAccumulator, BatchConfig, BatchError, BatchSnapshot};
pub use cache::{CacheConfig, CacheSnapshot, ResponseCache};
pub use config::{ConfigError, CoreConfig};
pub use dispatch::{QueueConfig, QueueSnapshot, TaskError, TaskHandle, TaskQueue};
pub use memory::{
    HeapMonitor, MemoryConfig, MemoryPressure, MonitorSnapshot, ObjectPool, PoolSnapshot, Pooled,
    ReclaimReport, RingBuffer,
};
pub use pipeline::{CoreSnapshot, GenerateError, GenerationCore};
pub use provider::{GenerationRequest, ProviderError, ProviderKind};
pub use retry::{RetryClass, RetryConfig, RetryExecutor, RetrySnapshot};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
