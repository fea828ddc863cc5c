//! Job queue over the coordination store.
//!
//! # Queue Structure
//!
//! - `{queue}`, `{queue}\x06\x163`, `{queue}\x06\x166`, `{queue}\x06\x169`:
//!   pending jobs per priority step, served lowest step first
//! - `{queue}:scheduled`: delayed jobs, scored by due time
//! - `{queue}:processing`: jobs claimed by a worker (for crash recovery)
//! - `{queue}:dead_letter`: jobs that failed after max attempts
//!
//! # Reliability
//!
//! Jobs are atomically moved from a pending list to the processing list when
//! dequeued. If a worker crashes, jobs left in the processing list can be
//! recovered and requeued.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::Job;
use crate::coordination::keys::{self, PRIORITY_STEPS};
use crate::coordination::{KeyValueBackend, RedisBackend};
use crate::error::CoordinationError;

/// How often an idle dequeue re-checks the lists.
const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum delayed jobs promoted per call.
const PROMOTE_BATCH: usize = 100;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// A priority job queue with delayed delivery.
pub struct JobQueue {
    backend: Arc<dyn KeyValueBackend>,
    queue_name: String,
    processing_queue: String,
    scheduled_queue: String,
    dead_letter_queue: String,
}

impl JobQueue {
    /// Connects to a Redis-backed queue.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let backend = RedisBackend::connect(redis_url).await?;
        Ok(Self::from_backend(Arc::new(backend), queue_name))
    }

    /// Creates a queue over an existing backend, sharing its connection.
    pub fn from_backend(backend: Arc<dyn KeyValueBackend>, queue_name: &str) -> Self {
        Self {
            backend,
            queue_name: queue_name.to_string(),
            processing_queue: keys::processing_queue(queue_name),
            scheduled_queue: keys::scheduled_queue(queue_name),
            dead_letter_queue: keys::dead_letter_queue(queue_name),
        }
    }

    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let list = keys::priority_queue(&self.queue_name, job.priority.step());
        self.backend.lpush(&list, &serialized).await?;
        debug!(job_id = %job.id, kind = job.kind_name(), court = job.court(), "Enqueued job");
        Ok(())
    }

    /// Enqueues `job` to become available after `delay`.
    pub async fn enqueue_in(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(job).await;
        }
        let serialized = serde_json::to_string(job)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.backend
            .zadd(&self.scheduled_queue, &serialized, due_ms)
            .await?;
        debug!(
            job_id = %job.id,
            court = job.court(),
            delay_ms = delay.as_millis() as u64,
            "Scheduled job"
        );
        Ok(())
    }

    /// Moves delayed jobs whose due time has passed onto their pending list.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due = self
            .backend
            .zrange_by_score(&self.scheduled_queue, now_ms, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for data in due {
            // Whoever removes the member owns the promotion.
            if !self.backend.zrem(&self.scheduled_queue, &data).await? {
                continue;
            }
            match serde_json::from_str::<Job>(&data) {
                Ok(job) => {
                    let list = keys::priority_queue(&self.queue_name, job.priority.step());
                    self.backend.lpush(&list, &data).await?;
                    promoted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping unreadable scheduled job");
                    self.push_dead_letter(&serde_json::json!({
                        "raw": data,
                        "error": e.to_string(),
                        "moved_at": Utc::now().to_rfc3339(),
                    }))
                    .await?;
                }
            }
        }
        Ok(promoted)
    }

    /// Claims the next job, waiting up to `wait` for one to appear.
    pub async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            self.promote_due().await?;
            if let Some(job) = self.try_dequeue().await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(DEQUEUE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn try_dequeue(&self) -> Result<Option<Job>, QueueError> {
        for step in PRIORITY_STEPS {
            let list = keys::priority_queue(&self.queue_name, step);
            let Some(data) = self.backend.rpoplpush(&list, &self.processing_queue).await? else {
                continue;
            };
            match serde_json::from_str::<Job>(&data) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    warn!(error = %e, queue = %list, "Dropping unreadable job");
                    self.backend.lrem(&self.processing_queue, &data).await?;
                    self.push_dead_letter(&serde_json::json!({
                        "raw": data,
                        "error": e.to_string(),
                        "moved_at": Utc::now().to_rfc3339(),
                    }))
                    .await?;
                }
            }
        }
        Ok(None)
    }

    /// Marks a claimed job as finished.
    pub async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.remove_job_from_processing(job_id).await
    }

    /// Releases a claimed job and schedules it to run again after `delay`.
    pub async fn requeue_in(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        self.remove_job_from_processing(job.id).await?;
        self.enqueue_in(job, delay).await
    }

    pub async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        self.remove_job_from_processing(job.id).await?;

        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        self.push_dead_letter(&entry).await
    }

    async fn push_dead_letter(&self, entry: &serde_json::Value) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(entry)?;
        self.backend
            .lpush(&self.dead_letter_queue, &serialized)
            .await?;
        Ok(())
    }

    /// Pending jobs across all priority steps. Delayed jobs are not counted.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for step in PRIORITY_STEPS {
            total += self
                .backend
                .llen(&keys::priority_queue(&self.queue_name, step))
                .await?;
        }
        Ok(total)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    pub async fn scheduled_len(&self) -> Result<usize, QueueError> {
        Ok(self.backend.zcard(&self.scheduled_queue).await?)
    }

    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        Ok(self.backend.llen(&self.processing_queue).await?)
    }

    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        Ok(self.backend.llen(&self.dead_letter_queue).await?)
    }

    /// Returns jobs left in the processing list by dead workers to the queue.
    ///
    /// Only call this when no worker of this queue is running.
    pub async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        let jobs = self.backend.lrange_all(&self.processing_queue).await?;

        for job_data in jobs {
            let Ok(mut job) = serde_json::from_str::<Job>(&job_data) else {
                continue;
            };
            // Increment attempts since this is effectively a retry
            job.increment_attempts();

            if job.should_retry() {
                self.backend.lrem(&self.processing_queue, &job_data).await?;
                self.enqueue(&job).await?;
                recovered += 1;
            } else {
                self.dead_letter(&job, "Recovered from processing queue after max attempts")
                    .await?;
            }
        }

        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, scheduled, processing, dead_letter) = tokio::try_join!(
            self.len(),
            self.scheduled_len(),
            self.processing_len(),
            self.dead_letter_len()
        )?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: pending,
            scheduled_jobs: scheduled,
            processing_jobs: processing,
            dead_letter_jobs: dead_letter,
        })
    }

    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let data = self.backend.lrange_all(&self.dead_letter_queue).await?;
        let entries: Result<Vec<serde_json::Value>, _> = data
            .iter()
            .take(limit)
            .map(|s| serde_json::from_str(s))
            .collect();
        Ok(entries?)
    }

    async fn remove_job_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let jobs = self.backend.lrange_all(&self.processing_queue).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<Job>(&job_data) {
                if job.id == job_id {
                    self.backend.lrem(&self.processing_queue, &job_data).await?;
                    return Ok(());
                }
            }
        }

        // Job not found is not an error - it might have been already removed
        Ok(())
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending_jobs: usize,
    pub scheduled_jobs: usize,
    pub processing_jobs: usize,
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.scheduled_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}
