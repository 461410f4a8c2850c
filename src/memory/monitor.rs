use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Budget the pressure ratios are computed against.
    pub max_bytes: usize,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    #[serde(with = "crate::config::serde_millis")]
    pub check_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    None,
    Warning,
    Critical,
}

/// Bytes released by one reclaim pass, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub before: usize,
    pub after: usize,
    pub released: usize,
}

type ReclaimFn = Box<dyn Fn() -> usize + Send + Sync>;

/// Tracks registered memory usage and sheds load when it crosses the
/// configured thresholds.
///
/// Components report allocations through `record_alloc`/`record_release`;
/// reclaim hooks (cache clear, pool shrink) registered here run whenever a
/// periodic check or an explicit `force_reclaim` finds pressure at Warning
/// or above. Each hook returns the bytes it released.
pub struct HeapMonitor {
    config: MemoryConfig,
    usage: AtomicUsize,
    peak: AtomicUsize,
    reclaimers: RwLock<Vec<ReclaimFn>>,
    ticks: AtomicU64,
    reclaims: AtomicU64,
    last_released: AtomicUsize,
}

impl HeapMonitor {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            usage: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            reclaimers: RwLock::new(Vec::new()),
            ticks: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            last_released: AtomicUsize::new(0),
        }
    }

    pub fn record_alloc(&self, bytes: usize) {
        let now = self.usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while now > peak {
            match self.peak.compare_exchange_weak(
                peak,
                now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    pub fn record_release(&self, bytes: usize) {
        // Saturating: a component double-reporting a release must not wrap.
        let _ = self
            .usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn pressure(&self) -> MemoryPressure {
        let ratio = self.usage() as f64 / self.config.max_bytes as f64;
        if ratio >= self.config.critical_threshold {
            MemoryPressure::Critical
        } else if ratio >= self.config.warning_threshold {
            MemoryPressure::Warning
        } else {
            MemoryPressure::None
        }
    }

    pub fn register_reclaimer<F>(&self, reclaimer: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.reclaimers.write().push(Box::new(reclaimer));
    }

    /// Run every reclaim hook now, recording before/after usage.
    pub fn force_reclaim(&self) -> ReclaimReport {
        let before = self.usage();
        let mut released = 0;
        for reclaimer in self.reclaimers.read().iter() {
            released += reclaimer();
        }
        self.record_release(released);
        let after = self.usage();
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        self.last_released.store(released, Ordering::Relaxed);
        tracing::info!(before, after, released, "memory reclaim pass");
        ReclaimReport {
            before,
            after,
            released,
        }
    }

    /// Spawn the periodic pressure check. Stops when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.tick(),
                }
            }
        })
    }

    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let pressure = self.pressure();
        if pressure >= MemoryPressure::Warning {
            tracing::warn!(
                usage = self.usage(),
                max_bytes = self.config.max_bytes,
                ?pressure,
                "memory pressure detected, reclaiming"
            );
            self.force_reclaim();
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            usage: self.usage(),
            peak: self.peak.load(Ordering::Relaxed),
            max_bytes: self.config.max_bytes,
            pressure: self.pressure(),
            ticks: self.ticks.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            last_released: self.last_released.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of monitor state, polled by the telemetry collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub usage: usize,
    pub peak: usize,
    pub max_bytes: usize,
    pub pressure: MemoryPressure,
    pub ticks: u64,
    pub reclaims: u64,
    pub last_released: usize,
}
