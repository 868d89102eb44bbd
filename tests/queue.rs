//! Tests for the durable job queue: ordering, delayed retries,
//! dead-lettering, cancellation, restart recovery, and the consumer loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use kiln::db::Db;
use kiln::error::KilnError;
use kiln::queue::{
    ClaimedJob, EnqueueOptions, HandlerOutcome, JobHandler, JobQueue, QueueName, backoff,
    run_consumer,
};
use tokio_util::sync::CancellationToken;

fn test_queue() -> Arc<JobQueue> {
    let db = Arc::new(Db::open_in_memory().unwrap());
    Arc::new(JobQueue::new(db))
}

fn options(attempts: u32) -> EnqueueOptions {
    EnqueueOptions {
        priority: 0,
        attempts,
        backoff_base: Duration::from_millis(10),
    }
}

async fn enqueue(queue: &JobQueue, key: &str, priority: i32) {
    queue
        .enqueue(
            QueueName::Image,
            key,
            "req-1",
            "{}",
            EnqueueOptions {
                priority,
                ..options(3)
            },
        )
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Ordering & claims
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claims_follow_priority_then_insertion_order() {
    let queue = test_queue();
    enqueue(&queue, "late-low", 5).await;
    enqueue(&queue, "first-high", 0).await;
    enqueue(&queue, "second-high", 0).await;

    let a = queue.claim(QueueName::Image).await.unwrap().unwrap();
    let b = queue.claim(QueueName::Image).await.unwrap().unwrap();
    let c = queue.claim(QueueName::Image).await.unwrap().unwrap();
    assert_eq!(a.job_key, "first-high");
    assert_eq!(b.job_key, "second-high");
    assert_eq!(c.job_key, "late-low");
    assert!(queue.claim(QueueName::Image).await.unwrap().is_none());
}

#[tokio::test]
async fn queues_are_independent() {
    let queue = test_queue();
    enqueue(&queue, "img", 0).await;
    assert!(queue.claim(QueueName::Model).await.unwrap().is_none());
    assert!(queue.claim(QueueName::Image).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_job_key_enqueues_once() {
    let queue = test_queue();
    enqueue(&queue, "same", 0).await;
    enqueue(&queue, "same", 0).await;
    assert!(queue.claim(QueueName::Image).await.unwrap().is_some());
    assert!(queue.claim(QueueName::Image).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_counts_attempts() {
    let queue = test_queue();
    enqueue(&queue, "job", 0).await;
    let job = queue.claim(QueueName::Image).await.unwrap().unwrap();
    assert_eq!(job.attempt, 1);
    assert_eq!(job.attempts_max, 3);
}

// ---------------------------------------------------------------------------
// Retry & dead-letter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_delays_then_redelivers() {
    let queue = test_queue();
    enqueue(&queue, "flaky", 0).await;

    let job = queue.claim(QueueName::Image).await.unwrap().unwrap();
    let will_retry = queue
        .ack_retry(&job, Duration::from_millis(10), "transient")
        .await
        .unwrap();
    assert!(will_retry);

    // Not due yet right after the ack.
    assert!(queue.claim(QueueName::Image).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let again = queue.claim(QueueName::Image).await.unwrap().unwrap();
    assert_eq!(again.job_key, "flaky");
    assert_eq!(again.attempt, 2);
}

#[tokio::test]
async fn exhausted_attempts_dead_letter() {
    let queue = test_queue();
    queue
        .enqueue(QueueName::Image, "doomed", "req-9", "{}", options(2))
        .await
        .unwrap();

    let first = queue.claim(QueueName::Image).await.unwrap().unwrap();
    assert!(queue.ack_retry(&first, Duration::from_millis(1), "err 1").await.unwrap());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = queue.claim(QueueName::Image).await.unwrap().unwrap();
    assert_eq!(second.attempt, 2);
    let will_retry = queue
        .ack_retry(&second, Duration::from_millis(1), "err 2")
        .await
        .unwrap();
    assert!(!will_retry);

    let dead = queue.dead_letters(QueueName::Image, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_key, "doomed");
    assert_eq!(dead[0].request_id, "req-9");
    assert_eq!(dead[0].attempts_made, 2);
    assert_eq!(dead[0].last_error.as_deref(), Some("err 2"));

    // Dead letters are never redelivered.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.claim(QueueName::Image).await.unwrap().is_none());
}

#[tokio::test]
async fn fatal_outcome_dead_letters_immediately() {
    let queue = test_queue();
    enqueue(&queue, "bad-input", 0).await;
    let job = queue.claim(QueueName::Image).await.unwrap().unwrap();
    queue.ack_fatal(&job.id, "undecodable payload").await.unwrap();

    let dead = queue.dead_letters(QueueName::Image, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts_made, 1);
}

// ---------------------------------------------------------------------------
// Cancellation & recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_for_request_stops_pending_and_delayed_jobs() {
    let queue = test_queue();
    enqueue(&queue, "a", 0).await;
    enqueue(&queue, "b", 0).await;

    // One job already delayed for retry, one still pending.
    let claimed = queue.claim(QueueName::Image).await.unwrap().unwrap();
    queue.ack_retry(&claimed, Duration::from_millis(1), "x").await.unwrap();

    let cancelled = queue.cancel_for_request("req-1").await.unwrap();
    assert_eq!(cancelled, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.claim(QueueName::Image).await.unwrap().is_none());
}

#[tokio::test]
async fn boot_recovery_requeues_claimed_jobs() {
    let queue = test_queue();
    enqueue(&queue, "interrupted", 0).await;
    queue.claim(QueueName::Image).await.unwrap().unwrap();

    // Simulates a process that died mid-handler.
    let recovered = queue.recover_claimed().await.unwrap();
    assert_eq!(recovered, 1);

    let again = queue.claim(QueueName::Image).await.unwrap().unwrap();
    assert_eq!(again.job_key, "interrupted");
    assert_eq!(again.attempt, 2);
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

/// Fails with a retryable error until `failures_left` runs out, then
/// succeeds. Records dead-letter callbacks.
struct FlakyHandler {
    failures_left: AtomicU32,
    handled: AtomicU32,
    dead_lettered: AtomicU32,
}

impl FlakyHandler {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            handled: AtomicU32::new(0),
            dead_lettered: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, _job: &ClaimedJob, _cancel: &CancellationToken) -> HandlerOutcome {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            HandlerOutcome::Retry(KilnError::Timeout(1))
        } else {
            HandlerOutcome::Success
        }
    }

    async fn dead_letter(&self, _job: &ClaimedJob, _message: &str) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll the queue until `state` holds `want` rows, with a hard deadline.
async fn wait_for_state(queue: &JobQueue, state: &str, want: u32) {
    let started = tokio::time::Instant::now();
    loop {
        if queue.count_in_state(QueueName::Image, state).await.unwrap() == want {
            return;
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "queue never reached {want} rows in state {state}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn consumer_retries_until_success() {
    let queue = test_queue();
    queue
        .enqueue(QueueName::Image, "flaky", "req-1", "{}", options(5))
        .await
        .unwrap();

    let handler = Arc::new(FlakyHandler::new(2));
    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(run_consumer(
        queue.clone(),
        QueueName::Image,
        2,
        Duration::from_secs(5),
        Duration::from_millis(10),
        handler.clone(),
        shutdown.clone(),
    ));

    wait_for_state(&queue, "done", 1).await;

    assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    assert_eq!(handler.dead_lettered.load(Ordering::SeqCst), 0);

    shutdown.cancel();
    let _ = consumer.await;
}

#[tokio::test]
async fn consumer_dead_letters_after_budget_and_notifies_handler() {
    let queue = test_queue();
    queue
        .enqueue(QueueName::Image, "doomed", "req-1", "{}", options(2))
        .await
        .unwrap();

    let handler = Arc::new(FlakyHandler::new(u32::MAX));
    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(run_consumer(
        queue.clone(),
        QueueName::Image,
        1,
        Duration::from_secs(5),
        Duration::from_millis(10),
        handler.clone(),
        shutdown.clone(),
    ));

    wait_for_state(&queue, "dead", 1).await;

    assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    assert_eq!(handler.dead_lettered.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    let _ = consumer.await;
}

#[tokio::test]
async fn backoff_grows_exponentially() {
    let base = Duration::from_secs(2);
    assert_eq!(backoff(base, 1), Duration::from_secs(2));
    assert_eq!(backoff(base, 2), Duration::from_secs(4));
    assert_eq!(backoff(base, 4), Duration::from_secs(16));
    assert!(backoff(base, 64) <= Duration::from_secs(300));
}
