use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Reusable-object pool.
///
/// `acquire` hands out a [`Pooled`] guard; dropping the guard resets the
/// object and returns it to the free list. Ownership of the guard is the
/// active set: an object that was never acquired cannot be released. The
/// free list is bounded by `max_idle`; overflow on return is dropped.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    max_idle: usize,
    stats: PoolStatsCollector,
}

#[derive(Debug, Default)]
struct PoolStatsCollector {
    active: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Immutable snapshot of pool state, polled by the telemetry collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub active: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

impl<T> ObjectPool<T> {
    pub fn new<F, R>(max_idle: usize, factory: F, reset: R) -> Arc<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            reset: Box::new(reset),
            max_idle,
            stats: PoolStatsCollector::default(),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let recycled = self.free.lock().pop();
        let value = match recycled {
            Some(value) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        };
        self.stats.active.fetch_add(1, Ordering::Release);
        Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        }
    }

    /// Trim the free list down to `keep` objects; returns how many were
    /// dropped. Wired into the heap monitor as a reclaim hook.
    pub fn shrink(&self, keep: usize) -> usize {
        let mut free = self.free.lock();
        let dropped = free.len().saturating_sub(keep);
        free.truncate(keep);
        if dropped > 0 {
            self.stats
                .discarded
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            active: self.stats.active.load(Ordering::Acquire),
            idle: self.idle(),
            created: self.stats.created.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
        }
    }

    fn give_back(&self, mut value: T) {
        (self.reset)(&mut value);
        self.stats.active.fetch_sub(1, Ordering::Release);
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(value);
        } else {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// RAII handle to a pooled object; returns it on drop.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value);
        }
    }
}
