//! Bounded-memory helpers for long-running generation loops.

mod monitor;
mod pool;
mod ring;

pub use monitor::{HeapMonitor, MemoryConfig, MemoryPressure, MonitorSnapshot, ReclaimReport};
pub use pool::{ObjectPool, PoolSnapshot, Pooled};
pub use ring::RingBuffer;
