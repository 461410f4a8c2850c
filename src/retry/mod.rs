//! Provider-aware retry with exponential backoff.
//!
//! Failures are classified per attempt from the provider flag and the
//! error's status/message. Overloaded Anthropic calls wait on a long fixed
//! curve (15s, 30s, 60s, ...); 5xx responses from any provider back off from
//! the configured base delay; everything else propagates immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::provider::{ProviderError, ProviderKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Base of the exponential curve for 5xx-class failures.
    #[serde(with = "crate::config::serde_millis")]
    pub base_delay: Duration,
    /// Base of the overload curve. Anthropic asks for long waits when
    /// saturated, so this is intentionally far above `base_delay`.
    #[serde(with = "crate::config::serde_millis")]
    pub overload_base_delay: Duration,
    #[serde(with = "crate::config::serde_millis")]
    pub max_delay: Duration,
    /// Randomize delays by ±50%. Off by default so backoff curves are exact.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            overload_base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    /// Provider signalled capacity exhaustion; wait on the long curve.
    Overload,
    /// 5xx-class server failure; standard exponential backoff.
    TransientServer,
    /// Not worth retrying; surface immediately.
    Fatal,
}

#[derive(Debug, Default)]
struct RetryStatsCollector {
    attempts: AtomicU64,
    retries: AtomicU64,
    overload_waits: AtomicU64,
    exhausted: AtomicU64,
    fatal: AtomicU64,
}

/// Immutable snapshot of retry activity, polled by the telemetry collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub overload_waits: u64,
    pub exhausted: u64,
    pub fatal: u64,
}

/// Runs operations against a provider, absorbing retryable failures up to
/// the attempt budget and surfacing the final error unchanged.
pub struct RetryExecutor {
    config: RetryConfig,
    stats: RetryStatsCollector,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: RetryStatsCollector::default(),
        }
    }

    pub fn classify(&self, provider: ProviderKind, error: &ProviderError) -> RetryClass {
        if provider == ProviderKind::Anthropic && error.is_overload() {
            RetryClass::Overload
        } else if error.is_server_error() {
            RetryClass::TransientServer
        } else {
            RetryClass::Fatal
        }
    }

    /// Delay before re-invoking after the failure of attempt
    /// `attempt_index + 1` (zero-based).
    pub fn delay_for(&self, class: RetryClass, attempt_index: u32) -> Duration {
        let base = match class {
            RetryClass::Overload => self.config.overload_base_delay,
            RetryClass::TransientServer => self.config.base_delay,
            RetryClass::Fatal => return Duration::ZERO,
        };
        let factor = 2u32.saturating_pow(attempt_index);
        let delay = base.saturating_mul(factor).min(self.config.max_delay);
        if self.config.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Invoke `operation`, retrying per classification until it succeeds or
    /// the attempt budget runs out. The most recent provider error is
    /// returned as-is; no wrapper type is introduced.
    pub async fn run<T, F, Fut>(
        &self,
        provider: ProviderKind,
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(%provider, attempt, "provider call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = self.classify(provider, &error);
            if class == RetryClass::Fatal {
                self.stats.fatal.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%provider, error = %error, "non-retryable provider failure");
                return Err(error);
            }
            if attempt >= self.config.max_attempts {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    %provider,
                    attempts = attempt,
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(error);
            }

            let delay = self.delay_for(class, attempt - 1);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            if class == RetryClass::Overload {
                self.stats.overload_waits.fetch_add(1, Ordering::Relaxed);
            }
            tracing::warn!(
                %provider,
                attempt,
                ?delay,
                status = ?error.status,
                "provider call failed, backing off"
            );
            sleep(delay).await;
        }
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            overload_waits: self.stats.overload_waits.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            fatal: self.stats.fatal.load(Ordering::Relaxed),
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let mut rng = rand::rng();
    let jitter_factor = rng.random_range(0.5..1.5);
    Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(RetryConfig::default())
    }

    #[test]
    fn overload_only_applies_to_anthropic() {
        let executor = executor();
        let overloaded = ProviderError::http(ProviderKind::Anthropic, 429, "Overloaded");
        assert_eq!(
            executor.classify(ProviderKind::Anthropic, &overloaded),
            RetryClass::Overload
        );

        // The same shape from another provider is not the overload curve.
        let limited = ProviderError::http(ProviderKind::OpenAi, 429, "Too Many Requests");
        assert_eq!(
            executor.classify(ProviderKind::OpenAi, &limited),
            RetryClass::Fatal
        );
    }

    #[test]
    fn five_xx_is_transient_for_any_provider() {
        let executor = executor();
        let err = ProviderError::http(ProviderKind::OpenAi, 503, "unavailable");
        assert_eq!(
            executor.classify(ProviderKind::OpenAi, &err),
            RetryClass::TransientServer
        );
    }

    #[test]
    fn overload_curve_doubles_from_fifteen_seconds() {
        let executor = executor();
        assert_eq!(
            executor.delay_for(RetryClass::Overload, 0),
            Duration::from_secs(15)
        );
        assert_eq!(
            executor.delay_for(RetryClass::Overload, 1),
            Duration::from_secs(30)
        );
        assert_eq!(
            executor.delay_for(RetryClass::Overload, 2),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn transient_curve_doubles_from_base_delay() {
        let executor = RetryExecutor::new(RetryConfig {
            base_delay: Duration::from_millis(100),
            ..Default::default()
        });
        assert_eq!(
            executor.delay_for(RetryClass::TransientServer, 0),
            Duration::from_millis(100)
        );
        assert_eq!(
            executor.delay_for(RetryClass::TransientServer, 3),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn delays_cap_at_max_delay() {
        let executor = RetryExecutor::new(RetryConfig {
            max_delay: Duration::from_secs(45),
            ..Default::default()
        });
        assert_eq!(
            executor.delay_for(RetryClass::Overload, 5),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let executor = RetryExecutor::new(RetryConfig {
            jitter: true,
            base_delay: Duration::from_millis(200),
            ..Default::default()
        });
        for _ in 0..32 {
            let delay = executor.delay_for(RetryClass::TransientServer, 0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }
}
