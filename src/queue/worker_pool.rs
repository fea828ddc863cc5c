//! Worker pool for crawl and probe jobs.
//!
//! Each worker is a tokio task looping over [`JobQueue::dequeue`] and handing
//! claimed jobs to a shared [`JobHandler`]. After each job the worker settles
//! it with the queue:
//!
//! - success: removed from the processing list
//! - [`JobOutcome::Deferred`]: rescheduled after the throttle wait, attempt refunded
//! - retryable crawl failure: rescheduled with a delay growing per attempt
//! - anything else: dead-lettered

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobKind};
use super::queue::{JobQueue, QueueError};
use super::runner::{JobError, JobHandler, JobOutcome};
use crate::metrics;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// How long an idle worker waits on the queue between shutdown checks.
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Multiplied by the attempt count to get the retry delay.
    pub retry_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(900),
            shutdown_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Point-in-time view of what the pool has done.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub completed: u64,
    pub failed: u64,
    /// Jobs sent back by the crawl throttle. They did no work.
    pub deferred: u64,
    pub busy_time: Duration,
}

impl PoolStats {
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn success_rate(&self) -> f64 {
        match self.processed() {
            0 => 0.0,
            total => self.completed as f64 * 100.0 / total as f64,
        }
    }

    pub fn mean_job_time(&self) -> Duration {
        match self.processed() {
            0 => Duration::ZERO,
            total => self.busy_time / total as u32,
        }
    }
}

#[derive(Default)]
struct Counters {
    busy: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
    busy_ms: AtomicU64,
}

impl Counters {
    fn begin(&self) {
        let busy = self.busy.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_workers(busy as usize);
    }

    fn end(&self, result: &Result<JobOutcome, JobError>, elapsed: Duration) {
        let busy = self.busy.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_active_workers(busy as usize);

        let counter = match result {
            Ok(JobOutcome::Deferred(_)) => {
                self.deferred.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(_) => &self.completed,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.busy_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, workers: usize) -> PoolStats {
        PoolStats {
            workers,
            busy: self.busy.load(Ordering::Relaxed) as usize,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            busy_time: Duration::from_millis(self.busy_ms.load(Ordering::Relaxed)),
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn with_queue(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            queue,
            handler,
            stop,
            handles: Vec::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Requeues jobs a previous run left claimed, then spawns the workers.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running() {
            return Err(PoolError::AlreadyRunning);
        }
        self.stop.send_replace(false);

        match self.queue.recover_processing_jobs().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Requeued jobs left in the processing list"),
            Err(e) => warn!(error = %e, "Could not recover processing jobs"),
        }

        for n in 0..self.config.workers {
            let worker = Worker {
                name: format!("worker-{n}"),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                stop: self.stop.subscribe(),
                config: self.config.clone(),
                counters: Arc::clone(&self.counters),
            };
            self.handles.push(tokio::spawn(worker.run()));
        }

        info!(
            workers = self.config.workers,
            queue = self.queue.queue_name(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Signals every worker and waits for in-flight jobs to settle.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        info!("Stopping worker pool");
        self.stop.send_replace(true);

        let handles = std::mem::take(&mut self.handles);
        let joined = tokio::time::timeout(self.config.shutdown_timeout, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked");
                }
            }
        })
        .await;

        match joined {
            Ok(()) => {
                info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.workers)
    }
}

struct Worker {
    name: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    stop: watch::Receiver<bool>,
    config: WorkerPoolConfig,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = %self.name, "Worker started");
        // A claimed job is always settled before the flag is read again.
        while !*self.stop.borrow() {
            match self.queue.dequeue(self.config.poll_interval).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Dequeue failed");
                    metrics::record_coordination_error("dequeue");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        debug!(worker = %self.name, "Worker stopped");
    }

    async fn process(&self, mut job: Job) {
        job.increment_attempts();
        debug!(
            worker = %self.name,
            job_id = %job.id,
            kind = job.kind_name(),
            court = job.court(),
            attempt = job.attempts,
            "Running job"
        );

        self.counters.begin();
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.job_timeout, self.handler.handle(&job))
            .await
            .unwrap_or(Err(JobError::Timeout(self.config.job_timeout)));
        let elapsed = started.elapsed();
        self.counters.end(&result, elapsed);

        let label = result.as_ref().map_or("error", JobOutcome::label);
        metrics::record_job(job.kind_name(), label, elapsed.as_secs_f64());

        let settled = match result {
            Ok(JobOutcome::Deferred(wait)) => {
                job.refund_attempt();
                self.queue.requeue_in(&job, wait).await
            }
            Ok(outcome) => {
                debug!(
                    worker = %self.name,
                    job_id = %job.id,
                    outcome = outcome.label(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job finished"
                );
                self.queue.complete(job.id).await
            }
            Err(e) => self.settle_failure(&job, &e).await,
        };
        if let Err(e) = settled {
            error!(worker = %self.name, job_id = %job.id, error = %e, "Could not settle job");
        }
    }

    async fn settle_failure(&self, job: &Job, e: &JobError) -> Result<(), QueueError> {
        // A probe releases its semaphore when it ends, so a rerun would not hold it.
        let retry = e.is_retryable()
            && matches!(job.kind, JobKind::Crawl { .. })
            && job.should_retry();
        if retry {
            let delay = self.config.retry_backoff.saturating_mul(job.attempts);
            warn!(
                worker = %self.name,
                job_id = %job.id,
                court = job.court(),
                error = %e,
                remaining = job.remaining_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Job failed, retrying later"
            );
            self.queue.requeue_in(job, delay).await
        } else {
            error!(
                worker = %self.name,
                job_id = %job.id,
                court = job.court(),
                error = %e,
                "Job failed, dead-lettering"
            );
            self.queue.dead_letter(job, &e.to_string()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryBackend;
    use crate::error::ReportError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn test_stats_rates() {
        let stats = PoolStats {
            workers: 4,
            completed: 3,
            failed: 1,
            deferred: 10,
            busy_time: Duration::from_secs(8),
            ..PoolStats::default()
        };
        assert_eq!(stats.processed(), 4);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(stats.mean_job_time(), Duration::from_secs(2));

        let idle = PoolStats::default();
        assert_eq!(idle.success_rate(), 0.0);
        assert_eq!(idle.mean_job_time(), Duration::ZERO);
    }

    #[test]
    fn test_deferrals_do_not_count_as_work() {
        let counters = Counters::default();
        counters.begin();
        counters.end(&Ok(JobOutcome::NotFound), Duration::from_millis(40));
        counters.begin();
        counters.end(&Ok(JobOutcome::Deferred(Duration::from_secs(2))), Duration::from_millis(5));

        let stats = counters.snapshot(1);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.busy_time, Duration::from_millis(40));
    }

    /// Returns scripted results in order, then `NotFound`.
    struct Scripted(Mutex<VecDeque<Result<JobOutcome, JobError>>>);

    impl Scripted {
        fn new(results: Vec<Result<JobOutcome, JobError>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(results.into())))
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, _job: &Job) -> Result<JobOutcome, JobError> {
            self.0.lock().unwrap().pop_front().unwrap_or(Ok(JobOutcome::NotFound))
        }
    }

    fn transient() -> Result<JobOutcome, JobError> {
        Err(JobError::Report(ReportError::RequestFailed("reset".into())))
    }

    fn worker(queue: &Arc<JobQueue>, results: Vec<Result<JobOutcome, JobError>>) -> Worker {
        let (_, stop) = watch::channel(false);
        Worker {
            name: "worker-test".to_string(),
            queue: Arc::clone(queue),
            handler: Scripted::new(results),
            stop,
            config: WorkerPoolConfig::new(1).with_job_timeout(Duration::from_secs(5)),
            counters: Arc::new(Counters::default()),
        }
    }

    fn queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::from_backend(Arc::new(MemoryBackend::new()), "iquery"))
    }

    async fn claim(queue: &JobQueue, job: &Job) -> Job {
        queue.enqueue(job).await.unwrap();
        queue.dequeue(Duration::ZERO).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_finished_job_leaves_processing() {
        let queue = queue();
        let worker = worker(&queue, vec![Ok(JobOutcome::Recorded { created: true })]);
        let job = claim(&queue, &Job::sweep_crawl("nysd", 1)).await;

        worker.process(job).await;
        assert_eq!(queue.stats().await.unwrap().total_jobs(), 0);
        assert_eq!(worker.counters.snapshot(1).completed, 1);
    }

    #[tokio::test]
    async fn test_deferred_job_is_rescheduled() {
        let queue = queue();
        let worker = worker(&queue, vec![Ok(JobOutcome::Deferred(Duration::from_secs(4)))]);
        let job = claim(&queue, &Job::sweep_crawl("nysd", 1)).await;

        worker.process(job).await;
        assert_eq!(queue.processing_len().await.unwrap(), 0);
        assert_eq!(queue.scheduled_len().await.unwrap(), 1);
        assert_eq!(worker.counters.snapshot(1).deferred, 1);
    }

    #[tokio::test]
    async fn test_crawl_failure_retries_until_attempts_run_out() {
        let queue = queue();
        let job = claim(&queue, &Job::sweep_crawl("nysd", 1).with_max_attempts(2)).await;
        worker(&queue, vec![transient()]).process(job).await;
        assert_eq!(queue.scheduled_len().await.unwrap(), 1);
        assert_eq!(queue.dead_letter_len().await.unwrap(), 0);

        let mut last_try = Job::sweep_crawl("nysd", 2).with_max_attempts(2);
        last_try.attempts = 1;
        let last_try = claim(&queue, &last_try).await;
        worker(&queue, vec![transient()]).process(last_try).await;
        assert_eq!(queue.dead_letter_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_is_dead_lettered() {
        let queue = queue();
        let job = claim(&queue, &Job::probe("nysd")).await;

        worker(&queue, vec![transient()]).process(job).await;
        assert_eq!(queue.scheduled_len().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let queue = queue();
        queue.enqueue(&Job::sweep_crawl("nysd", 1)).await.unwrap();
        let handler = Scripted::new(vec![Ok(JobOutcome::Recorded { created: true })]);
        let config = WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(20));
        let mut pool = WorkerPool::with_queue(config, Arc::clone(&queue), handler);

        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        for _ in 0..50 {
            if pool.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.stats().completed, 1);

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }
}
