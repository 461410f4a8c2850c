//! Response caching keyed by request fingerprint.
//!
//! Identical generation requests within the TTL window are served from
//! memory instead of re-invoking the provider. Eviction is true LRU; expiry
//! is checked once per access with an independent periodic sweep.

mod fingerprint;
mod ttl;

pub use fingerprint::request_fingerprint;
pub use ttl::{CacheConfig, CacheSnapshot, ResponseCache};
