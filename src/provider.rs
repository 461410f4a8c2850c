//! Provider identity and the error surface shared by every generation call.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generative-text backends the pipeline can be pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// Error returned by a provider call.
///
/// Retry classification reads only `status` and `message`, so callers wrap
/// whatever their SDK surfaces into this shape and the original information
/// travels through the retry loop unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider} request failed: {message}")]
pub struct ProviderError {
    pub provider: ProviderKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    /// An error carrying an HTTP status from the provider.
    pub fn http(provider: ProviderKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider,
            status: Some(status),
            message: message.into(),
        }
    }

    /// A transport-level failure with no HTTP status.
    pub fn network(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            status: None,
            message: message.into(),
        }
    }

    /// Capacity-exhaustion signal: HTTP 429 or an overload marker in the
    /// message body.
    pub fn is_overload(&self) -> bool {
        if self.status == Some(429) {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("overloaded") || message.contains("capacity")
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status, Some(500..=599))
    }
}

/// One unit of text generation, as seen by the cache and the dispatcher.
///
/// The fingerprint covers every field that changes provider output, so two
/// requests with equal fingerprints are interchangeable for caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub provider: ProviderKind,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn new(
        provider: ProviderKind,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            prompt: prompt.into(),
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Opaque cache key derived from all output-relevant fields.
    pub fn fingerprint(&self) -> String {
        crate::cache::request_fingerprint(self)
    }

    pub(crate) fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.provider.hash(state);
        self.model.hash(state);
        self.prompt.hash(state);
        // f32 is not Hash; the bit pattern is stable and distinguishes values.
        self.temperature.map(f32::to_bits).hash(state);
    }
}
