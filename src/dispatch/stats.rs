use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free queue statistics using atomic operations.
#[derive(Debug, Default)]
pub(crate) struct QueueStatsCollector {
    running: AtomicUsize,
    pending: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

impl QueueStatsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Counted at submission time so channel-buffered tasks are visible to
    /// `drain` before the dispatcher has seen them.
    pub(crate) fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Undo of `task_submitted` when the dispatcher is already gone.
    pub(crate) fn task_rejected(&self) {
        self.submitted.fetch_sub(1, Ordering::Relaxed);
        self.pending.fetch_sub(1, Ordering::Release);
    }

    /// Pending -> running handoff. Running is incremented first so there is
    /// no instant where both counters read zero mid-transition.
    pub(crate) fn task_activated(&self) {
        self.running.fetch_add(1, Ordering::Release);
        self.pending.fetch_sub(1, Ordering::Release);
    }

    pub(crate) fn task_cancelled(&self) {
        self.pending.fetch_sub(1, Ordering::Release);
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self) {
        self.running.fetch_sub(1, Ordering::Release);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tasks_dropped(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
        self.cancelled.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && self.running.load(Ordering::Acquire) == 0
    }

    pub(crate) fn snapshot(&self, concurrency_limit: usize) -> QueueSnapshot {
        QueueSnapshot {
            running: self.running.load(Ordering::Acquire),
            pending: self.pending.load(Ordering::Acquire),
            concurrency_limit,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            average_task_ms: 0.0,
        }
    }
}

/// Immutable snapshot of queue state, polled by the telemetry collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub running: usize,
    pub pending: usize,
    pub concurrency_limit: usize,
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    /// Mean duration over the recent-task window; zero until a task
    /// completes.
    pub average_task_ms: f64,
}

impl QueueSnapshot {
    pub fn in_flight(&self) -> usize {
        self.running + self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_and_activation_keep_counts_consistent() {
        let stats = QueueStatsCollector::new();
        stats.task_submitted();
        stats.task_submitted();
        let snapshot = stats.snapshot(4);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.submitted, 2);

        stats.task_activated();
        let snapshot = stats.snapshot(4);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.running, 1);
        assert!(!stats.is_idle());

        stats.task_finished();
        stats.task_cancelled();
        let snapshot = stats.snapshot(4);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert!(stats.is_idle());
    }
}
