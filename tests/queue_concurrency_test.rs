use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use inkra_core::dispatch::{QueueConfig, TaskQueue};
use tokio::time::{Instant, sleep};

fn queue(concurrency_limit: usize) -> TaskQueue {
    TaskQueue::new(QueueConfig { concurrency_limit })
}

#[tokio::test(start_paused = true)]
async fn running_never_exceeds_concurrency_limit() {
    let queue = queue(2);
    let current = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let current = Arc::clone(&current);
        let max_observed = Arc::clone(&max_observed);
        handles.push(queue.add(async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max_observed.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(100)).await;
            current.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(max_observed.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn five_tasks_at_limit_two_take_three_rounds() {
    let queue = queue(2);
    let started = Instant::now();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            queue.add(async {
                sleep(Duration::from_millis(100)).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(350),
        "expected ~300ms of virtual time, got {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn add_is_non_blocking_while_tasks_run() {
    let queue = queue(1);
    let first = queue.add(async {
        sleep(Duration::from_millis(50)).await;
        1
    });

    // Submitting more work must not wait on the running task.
    let submit_started = Instant::now();
    let second = queue.add(async { 2 });
    assert_eq!(submit_started.elapsed(), Duration::ZERO);

    assert_eq!(first.await.unwrap(), 1);
    assert_eq!(second.await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn stats_reflect_queue_state() {
    let queue = queue(1);
    let slow = queue.add(async {
        sleep(Duration::from_millis(100)).await;
    });
    let waiting = queue.add(async {});

    // Let the dispatcher pick up the first task.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.concurrency_limit, 1);
    assert_eq!(snapshot.running + snapshot.pending, 2);
    assert!(snapshot.running <= 1);

    slow.await.unwrap();
    waiting.await.unwrap();
    queue.drain().await;

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.running, 0);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.completed, 2);
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_pending_and_running() {
    let queue = Arc::new(queue(2));
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let finished = Arc::clone(&finished);
        // Handles intentionally dropped; drain alone must observe completion.
        let _ = queue.add(async move {
            sleep(Duration::from_millis(20)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    queue.drain().await;
    assert_eq!(finished.load(Ordering::SeqCst), 6);
    assert!(queue.snapshot().pending == 0 && queue.snapshot().running == 0);
}

#[tokio::test(start_paused = true)]
async fn failing_task_does_not_disturb_siblings() {
    let queue = queue(2);
    let bad = queue.add(async { Err::<u32, String>("provider exploded".into()) });
    let good = queue.add(async {
        sleep(Duration::from_millis(10)).await;
        Ok::<u32, String>(11)
    });

    assert_eq!(bad.await.unwrap(), Err("provider exploded".to_string()));
    assert_eq!(good.await.unwrap(), Ok(11));
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_later_submissions() {
    let queue = queue(2);
    let before = queue.add(async { 1 });
    queue.shutdown().await;

    assert_eq!(before.await.unwrap(), 1);
    let after = queue.add(async { 2 });
    assert!(after.await.is_err());
}
