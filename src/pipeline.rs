//! Assembly root for the generation core.
//!
//! One `GenerationCore` is constructed at process start and handed by
//! reference to every consumer; there is no global state. Tearing it down is
//! an explicit `shutdown()`.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchAccumulator, BatchConfig};
use crate::cache::{CacheSnapshot, ResponseCache};
use crate::config::{ConfigError, CoreConfig};
use crate::dispatch::{QueueSnapshot, TaskError, TaskQueue};
use crate::memory::{HeapMonitor, MonitorSnapshot};
use crate::provider::{GenerationRequest, ProviderError};
use crate::retry::{RetryExecutor, RetrySnapshot};

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Queue(#[from] TaskError),
}

/// Aggregate of every component snapshot, polled by the telemetry
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSnapshot {
    pub queue: QueueSnapshot,
    pub cache: CacheSnapshot,
    pub retry: RetrySnapshot,
    pub memory: MonitorSnapshot,
}

/// The provider-mediation core: queue, cache, retry, and memory monitor
/// wired together. Must be created inside a Tokio runtime.
pub struct GenerationCore {
    queue: TaskQueue,
    cache: Arc<ResponseCache<String>>,
    retry: Arc<RetryExecutor>,
    monitor: Arc<HeapMonitor>,
    batch_config: BatchConfig,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl GenerationCore {
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let queue = TaskQueue::new(config.queue.clone());
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let retry = Arc::new(RetryExecutor::new(config.retry.clone()));
        let monitor = Arc::new(HeapMonitor::new(config.memory.clone()));

        // Under pressure the cheapest memory to give back is cached prose.
        {
            let cache = Arc::clone(&cache);
            monitor.register_reclaimer(move || {
                let released = cache.approx_memory_bytes();
                cache.clear();
                released
            });
        }

        let cancel = CancellationToken::new();
        let background = vec![
            cache.start_sweeper(cancel.child_token()),
            monitor.start(cancel.child_token()),
        ];

        tracing::info!(
            concurrency_limit = config.queue.concurrency_limit,
            cache_max_entries = config.cache.max_entries,
            "generation core started"
        );

        Ok(Self {
            queue,
            cache,
            retry,
            monitor,
            batch_config: config.batch,
            cancel,
            background: Mutex::new(background),
        })
    }

    /// Run one generation request through cache, queue, and retry.
    ///
    /// `operation` produces a fresh provider-call future per attempt. A
    /// cache hit skips the provider entirely; a successful miss populates
    /// the cache under the request fingerprint.
    pub async fn generate<F, Fut>(
        &self,
        request: &GenerationRequest,
        operation: F,
    ) -> Result<String, GenerateError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, ProviderError>> + Send + 'static,
    {
        let key = request.fingerprint();
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(fingerprint = %key, "serving generation from cache");
            return Ok(cached);
        }

        let retry = Arc::clone(&self.retry);
        let provider = request.provider;
        let handle = self
            .queue
            .add(async move { retry.run(provider, operation).await });
        let output = handle.await??;

        self.cache.set(key, output.clone());
        Ok(output)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<ResponseCache<String>> {
        &self.cache
    }

    pub fn retry(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    pub fn monitor(&self) -> &Arc<HeapMonitor> {
        &self.monitor
    }

    /// A fresh accumulator using this core's batch configuration. Consumers
    /// own the returned value and its processor.
    pub fn batch_accumulator<T: Clone + Send + 'static>(&self) -> BatchAccumulator<T> {
        BatchAccumulator::new(self.batch_config.clone())
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            queue: self.queue.snapshot(),
            cache: self.cache.snapshot(),
            retry: self.retry.snapshot(),
            memory: self.monitor.snapshot(),
        }
    }

    /// Stop admission, wait for in-flight work, stop background loops.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.cancel.cancel();
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("generation core shut down");
    }
}
