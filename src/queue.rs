//! Durable job queues backing the image and model worker pools.
//!
//! Rows live in the same SQLite file as the entities (`queue_jobs`), so
//! pending and delayed work survives restarts. Scheduling state here is
//! distinct from the entity-facing `image_jobs` / `model_jobs` rows: those
//! mirror lifecycle for clients, these carry claims, delays, and the
//! dead-letter sink.
//!
//! Delivery is at-least-once: a claim bumps `attempts_made` before the
//! handler runs, and handlers are idempotent on entity id. Ordering is
//! priority first, then insertion order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::db::{Db, fmt_ts, parse_ts_opt};
use crate::error::KilnError;
use crate::model::new_id;

/// Cap on the exponential retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Completed rows older than this are pruned on ack.
const DONE_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Completed rows beyond this count (per queue, newest first) are pruned.
const DONE_RETENTION_COUNT: u32 = 1000;

/// Idle poll interval when no enqueue notification arrives; also how often
/// delayed retries become visible.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Image,
    Model,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Lower runs first.
    pub priority: i32,
    /// Total attempts before dead-lettering.
    pub attempts: u32,
    /// Base for exponential retry backoff.
    pub backoff_base: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// A job handed to a handler. `payload` is a small JSON map of ids: never
/// entities; handlers re-read rows themselves.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub job_key: String,
    pub request_id: String,
    pub payload: String,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub attempts_max: u32,
}

/// Dead-letter entry, readable by operators, never auto-retried.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job_key: String,
    pub request_id: String,
    pub payload: String,
    pub attempts_made: u32,
    pub last_error: Option<String>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

/// What a handler reports back to the queue.
pub enum HandlerOutcome {
    Success,
    /// Transient failure: schedule a delayed retry, dead-letter when the
    /// attempt budget runs out.
    Retry(KilnError),
    /// The handler has already marked its entity failed; dead-letter now.
    Fatal(KilnError),
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ClaimedJob, cancel: &CancellationToken) -> HandlerOutcome;

    /// Called when the queue dead-letters a job the handler still expected
    /// to retry (budget exhausted or job timeout): the handler's chance to
    /// push its entity into a terminal FAILED state and publish the
    /// matching event. Must be idempotent.
    async fn dead_letter(&self, job: &ClaimedJob, message: &str);
}

pub struct JobQueue {
    db: Arc<Db>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn enqueue(
        &self,
        queue: QueueName,
        job_key: &str,
        request_id: &str,
        payload: &str,
        options: EnqueueOptions,
    ) -> Result<(), KilnError> {
        let (job_key, request_id, payload) =
            (job_key.to_string(), request_id.to_string(), payload.to_string());
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                conn.execute(
                    "INSERT INTO queue_jobs
                         (id, queue, job_key, request_id, payload, priority,
                          attempts_max, attempts_made, state, run_at,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'pending', ?8, ?8, ?8)
                     ON CONFLICT (queue, job_key) DO NOTHING",
                    params![
                        new_id(),
                        queue.as_str(),
                        job_key,
                        request_id,
                        payload,
                        options.priority,
                        options.attempts,
                        ts,
                    ],
                )?;
                Ok(())
            })
            .await?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Claim the oldest due job: priority first, then insertion order.
    /// The claim itself counts the attempt.
    pub async fn claim(&self, queue: QueueName) -> Result<Option<ClaimedJob>, KilnError> {
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                conn.query_row(
                    "UPDATE queue_jobs
                     SET state = 'claimed', attempts_made = attempts_made + 1,
                         claimed_at = ?1, updated_at = ?1
                     WHERE id = (
                         SELECT id FROM queue_jobs
                         WHERE queue = ?2
                           AND (state = 'pending'
                                OR (state = 'delayed' AND run_at <= ?1))
                         ORDER BY priority ASC, created_at ASC, id ASC
                         LIMIT 1
                     )
                     RETURNING id, job_key, request_id, payload, attempts_made, attempts_max",
                    params![ts, queue.as_str()],
                    |row| {
                        Ok(ClaimedJob {
                            id: row.get(0)?,
                            job_key: row.get(1)?,
                            request_id: row.get(2)?,
                            payload: row.get(3)?,
                            attempt: row.get(4)?,
                            attempts_max: row.get(5)?,
                        })
                    },
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// Mark a claimed job done and prune old completed rows.
    pub async fn ack_success(&self, queue: QueueName, job_id: &str) -> Result<(), KilnError> {
        let job_id = job_id.to_string();
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE queue_jobs SET state = 'done', finished_at = ?2, updated_at = ?2
                     WHERE id = ?1",
                    params![job_id, ts],
                )?;
                let cutoff = fmt_ts(Utc::now() - DONE_RETENTION);
                tx.execute(
                    "DELETE FROM queue_jobs
                     WHERE queue = ?1 AND state = 'done' AND finished_at < ?2",
                    params![queue.as_str(), cutoff],
                )?;
                tx.execute(
                    "DELETE FROM queue_jobs
                     WHERE queue = ?1 AND state = 'done' AND id NOT IN (
                         SELECT id FROM queue_jobs
                         WHERE queue = ?1 AND state = 'done'
                         ORDER BY finished_at DESC LIMIT ?2
                     )",
                    params![queue.as_str(), DONE_RETENTION_COUNT],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Schedule a delayed retry with exponential backoff, or dead-letter
    /// when attempts are exhausted. Returns true when the job will retry.
    pub async fn ack_retry(
        &self,
        job: &ClaimedJob,
        backoff_base: Duration,
        message: &str,
    ) -> Result<bool, KilnError> {
        if job.attempt >= job.attempts_max {
            self.dead_letter_row(&job.id, message).await?;
            return Ok(false);
        }
        let delay = backoff(backoff_base, job.attempt);
        let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let (job_id, message) = (job.id.clone(), message.to_string());
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                conn.execute(
                    "UPDATE queue_jobs SET state = 'delayed', run_at = ?2,
                         last_error = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![job_id, fmt_ts(run_at), message, ts],
                )?;
                Ok(())
            })
            .await?;
        Ok(true)
    }

    /// Dead-letter a claimed job immediately (fatal handler outcome).
    pub async fn ack_fatal(&self, job_id: &str, message: &str) -> Result<(), KilnError> {
        self.dead_letter_row(job_id, message).await
    }

    async fn dead_letter_row(&self, job_id: &str, message: &str) -> Result<(), KilnError> {
        let (job_id, message) = (job_id.to_string(), message.to_string());
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                conn.execute(
                    "UPDATE queue_jobs SET state = 'dead', last_error = ?2,
                         finished_at = ?3, updated_at = ?3
                     WHERE id = ?1",
                    params![job_id, message, ts],
                )?;
                Ok(())
            })
            .await
    }

    /// Flip pending/delayed jobs of a deleted request to cancelled. A
    /// running handler discovers the deletion on its next entity read.
    pub async fn cancel_for_request(&self, request_id: &str) -> Result<u32, KilnError> {
        let request_id = request_id.to_string();
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                let changed = conn.execute(
                    "UPDATE queue_jobs SET state = 'cancelled', finished_at = ?2, updated_at = ?2
                     WHERE request_id = ?1 AND state IN ('pending', 'delayed')",
                    params![request_id, ts],
                )?;
                Ok(changed as u32)
            })
            .await
    }

    /// Jobs left claimed by a previous process are returned to pending at
    /// boot.
    pub async fn recover_claimed(&self) -> Result<u32, KilnError> {
        self.db
            .call(move |conn| {
                let ts = fmt_ts(Utc::now());
                let changed = conn.execute(
                    "UPDATE queue_jobs SET state = 'pending', claimed_at = NULL, updated_at = ?1
                     WHERE state = 'claimed'",
                    params![ts],
                )?;
                Ok(changed as u32)
            })
            .await
    }

    pub async fn dead_letters(
        &self,
        queue: QueueName,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, KilnError> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_key, request_id, payload, attempts_made, last_error, finished_at
                     FROM queue_jobs
                     WHERE queue = ?1 AND state = 'dead'
                     ORDER BY finished_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![queue.as_str(), limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (job_key, request_id, payload, attempts_made, last_error, finished) = row?;
                    out.push(DeadLetter {
                        job_key,
                        request_id,
                        payload,
                        attempts_made,
                        last_error,
                        finished_at: parse_ts_opt(finished)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Count of rows in a given state: aggregate telemetry for tests and
    /// operators.
    pub async fn count_in_state(&self, queue: QueueName, state: &str) -> Result<u32, KilnError> {
        let state = state.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND state = ?2",
                    params![queue.as_str(), state],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
    }

    fn notified(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// Exponential backoff: `base × 2^(attempt-1)`, capped.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

/// Drive one queue with bounded concurrency until shutdown.
///
/// Each claimed job runs under `job_timeout`; on expiry the handler future
/// is dropped, its cancellation token fires, and the attempt counts as a
/// retryable failure. Entity state left mid-transition is reconciled by the
/// next attempt's re-read.
pub async fn run_consumer(
    queue: Arc<JobQueue>,
    name: QueueName,
    concurrency: usize,
    job_timeout: Duration,
    backoff_base: Duration,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let notify = queue.notified();

    tracing::info!(queue = name.as_str(), concurrency, "queue consumer started");

    loop {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let job = match queue.claim(name).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }
            Err(e) => {
                drop(permit);
                tracing::error!(queue = name.as_str(), "claim failed: {e}");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let queue = queue.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let cancel = CancellationToken::new();

            let outcome = match tokio::time::timeout(job_timeout, handler.handle(&job, &cancel))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    HandlerOutcome::Retry(KilnError::Timeout(job_timeout.as_millis() as u64))
                }
            };

            let ack = match outcome {
                HandlerOutcome::Success => queue.ack_success(name, &job.id).await,
                HandlerOutcome::Retry(err) => {
                    let message = err.user_message();
                    match queue.ack_retry(&job, backoff_base, &message).await {
                        Ok(true) => {
                            tracing::warn!(
                                queue = name.as_str(),
                                job_key = job.job_key,
                                attempt = job.attempt,
                                "job failed, retrying: {message}"
                            );
                            Ok(())
                        }
                        Ok(false) => {
                            tracing::warn!(
                                queue = name.as_str(),
                                job_key = job.job_key,
                                "attempts exhausted, dead-lettered: {message}"
                            );
                            handler.dead_letter(&job, &message).await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                HandlerOutcome::Fatal(err) => {
                    let message = err.user_message();
                    tracing::warn!(
                        queue = name.as_str(),
                        job_key = job.job_key,
                        "job failed fatally, dead-lettered: {message}"
                    );
                    queue.ack_fatal(&job.id, &message).await
                }
            };

            if let Err(e) = ack {
                tracing::error!(
                    queue = name.as_str(),
                    job_key = job.job_key,
                    "failed to ack job: {e}"
                );
            }
        });
    }

    tracing::info!(queue = name.as_str(), "queue consumer stopped");
}
