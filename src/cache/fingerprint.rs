use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use crate::provider::GenerationRequest;

/// Opaque cache key covering every output-relevant request field.
///
/// Stable within a process run, which is all the in-memory cache needs.
pub fn request_fingerprint(request: &GenerationRequest) -> String {
    let mut hasher = DefaultHasher::new();
    request.hash_into(&mut hasher);
    format!("{:016x}", hasher.finish())
}
