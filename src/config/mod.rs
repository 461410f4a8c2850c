//! Aggregate configuration for the generation core.
//!
//! Each component owns its config struct (with production defaults); this
//! module combines them, layers `INKRA_*` environment overrides on top, and
//! validates cross-field constraints before anything is constructed.

pub mod serde_millis;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::dispatch::QueueConfig;
use crate::memory::MemoryConfig;
use crate::retry::RetryConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Environment error: {0}")]
    EnvError(String),
}

/// Helper to load and parse an environment variable.
/// Leaves the target untouched if the variable is absent.
fn load_env_var<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *target = value
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {name}: {e}")))?;
    }
    Ok(())
}

fn load_env_millis(name: &str, target: &mut std::time::Duration) -> Result<(), ConfigError> {
    let mut millis = target.as_millis() as u64;
    load_env_var(name, &mut millis)?;
    *target = std::time::Duration::from_millis(millis);
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub memory: MemoryConfig,
}

impl CoreConfig {
    /// Defaults with `INKRA_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        load_env_var("INKRA_CONCURRENCY_LIMIT", &mut self.queue.concurrency_limit)?;
        load_env_var("INKRA_CACHE_MAX_ENTRIES", &mut self.cache.max_entries)?;
        load_env_millis("INKRA_CACHE_TTL_MS", &mut self.cache.ttl)?;
        load_env_millis("INKRA_CACHE_SWEEP_INTERVAL_MS", &mut self.cache.sweep_interval)?;
        load_env_var("INKRA_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        load_env_millis("INKRA_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay)?;
        load_env_var("INKRA_BATCH_MAX_SIZE", &mut self.batch.max_size)?;
        load_env_millis("INKRA_BATCH_MAX_WAIT_MS", &mut self.batch.max_wait)?;
        load_env_var("INKRA_MEMORY_MAX_BYTES", &mut self.memory.max_bytes)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // concurrency_limit == 0 is intentionally legal: tasks queue forever.

        if self.cache.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Cache sweep interval must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "Retry max attempts must be greater than 0".to_string(),
            ));
        }

        if self.batch.max_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch max size must be greater than 0".to_string(),
            ));
        }

        if self.batch.max_wait.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Batch max wait must be greater than 0".to_string(),
            ));
        }

        if self.memory.max_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "Memory budget must be greater than 0".to_string(),
            ));
        }

        let warning = self.memory.warning_threshold;
        let critical = self.memory.critical_threshold;
        if !(0.0..=1.0).contains(&warning) || !(0.0..=1.0).contains(&critical) {
            return Err(ConfigError::InvalidConfig(
                "Memory thresholds must be within 0.0..=1.0".to_string(),
            ));
        }
        if warning > critical {
            return Err(ConfigError::InvalidConfig(format!(
                "Memory warning threshold ({warning}) must not exceed critical threshold ({critical})"
            )));
        }

        if self.memory.check_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Memory check interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
