use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::stats::{QueueSnapshot, QueueStatsCollector};
use crate::memory::RingBuffer;

/// Completed-task durations kept for the rolling latency average.
const LATENCY_WINDOW: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Queue is closed")]
    QueueClosed,
    #[error("Task was cancelled before it started")]
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on simultaneously running tasks. Zero queues forever.
    pub concurrency_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
        }
    }
}

struct QueuedTask {
    job: BoxFuture<'static, ()>,
    cancel: CancellationToken,
}

/// FIFO task queue admitting at most `concurrency_limit` running tasks.
///
/// Tasks are opaque futures; the queue never inspects their output. Each
/// submission gets its own result channel, so one task's failure cannot leak
/// into a sibling's handle. Must be created inside a Tokio runtime.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
    stats: Arc<QueueStatsCollector>,
    latency: Arc<Mutex<RingBuffer<f64>>>,
    idle: Arc<Notify>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStatsCollector::new());
        let latency = Arc::new(Mutex::new(RingBuffer::new(LATENCY_WINDOW)));
        let idle = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let semaphore = Arc::new(Semaphore::new(config.concurrency_limit));
        tokio::spawn(dispatch_loop(
            rx,
            semaphore,
            Arc::clone(&stats),
            Arc::clone(&latency),
            Arc::clone(&idle),
            shutdown.clone(),
        ));
        tracing::debug!(
            concurrency_limit = config.concurrency_limit,
            "task queue started"
        );

        Self {
            tx,
            stats,
            latency,
            idle,
            closed: AtomicBool::new(false),
            shutdown,
            config,
        }
    }

    /// Submit a task. Non-blocking: the returned handle resolves once the
    /// task has run (or reports why it never will).
    pub fn add<R, Fut>(&self, fut: Fut) -> TaskHandle<R>
    where
        R: Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let mut handle = TaskHandle {
            rx: done_rx,
            cancel: cancel.clone(),
            rejected: false,
        };

        if self.closed.load(Ordering::Acquire) {
            handle.rejected = true;
            return handle;
        }

        self.stats.task_submitted();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        if self.tx.send(QueuedTask { job, cancel }).is_err() {
            self.stats.task_rejected();
            handle.rejected = true;
        }
        handle
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut snapshot = self.stats.snapshot(self.config.concurrency_limit);
        snapshot.average_task_ms = self.latency.lock().average().unwrap_or(0.0);
        snapshot
    }

    /// Resolves once running and pending are both empty.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.stats.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop admission; already-queued tasks still run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close, wait for quiescence, then stop the dispatcher.
    pub async fn shutdown(&self) {
        self.close();
        self.drain().await;
        self.shutdown.cancel();
        tracing::debug!("task queue shut down");
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    semaphore: Arc<Semaphore>,
    stats: Arc<QueueStatsCollector>,
    latency: Arc<Mutex<RingBuffer<f64>>>,
    idle: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let mut pending: VecDeque<QueuedTask> = VecDeque::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => {
                match received {
                    Some(task) => pending.push_back(task),
                    None => break,
                }
            }
            permit = Arc::clone(&semaphore).acquire_owned(), if !pending.is_empty() => {
                // The semaphore is never closed, so acquisition only fails
                // if the runtime is tearing down around us.
                let Ok(permit) = permit else { break };
                let Some(task) = pending.pop_front() else { continue };

                if task.cancel.is_cancelled() {
                    stats.task_cancelled();
                    idle.notify_waiters();
                    continue;
                }

                stats.task_activated();
                let stats = Arc::clone(&stats);
                let latency = Arc::clone(&latency);
                let idle = Arc::clone(&idle);
                tokio::spawn(async move {
                    let _permit = permit;
                    let started = std::time::Instant::now();
                    task.job.await;
                    latency.lock().push(started.elapsed().as_secs_f64() * 1000.0);
                    stats.task_finished();
                    idle.notify_waiters();
                });
            }
        }
    }

    // Account for tasks that will never start; their handles resolve with
    // QueueClosed when the result senders drop here.
    rx.close();
    let mut dropped = pending.len();
    pending.clear();
    while let Ok(task) = rx.try_recv() {
        drop(task);
        dropped += 1;
    }
    if dropped > 0 {
        stats.tasks_dropped(dropped);
        tracing::warn!(dropped, "dispatcher stopped with unstarted tasks");
    }
    idle.notify_waiters();
}

/// Handle to a submitted task. Awaiting it yields the task's output, or a
/// [`TaskError`] if the task never ran.
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<R>,
    cancel: CancellationToken,
    rejected: bool,
}

impl<R> TaskHandle<R> {
    /// Abandon the task if it has not started yet. Running tasks are
    /// unaffected and still complete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.rejected {
            return Poll::Ready(Err(TaskError::QueueClosed));
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => {
                let reason = if this.cancel.is_cancelled() {
                    TaskError::Cancelled
                } else {
                    TaskError::QueueClosed
                };
                Poll::Ready(Err(reason))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
