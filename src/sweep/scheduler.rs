//! Per-court sweep state machine and the daemon loop that drives it.
//!
//! Each tick looks at one court and takes exactly one step:
//!
//! 1. cooling down: skip
//! 2. `init < final`: issue a crawl for `init + 1`, short cooldown
//! 3. caught up, database knows a higher ID: raise `final`, short cooldown
//! 4. caught up otherwise: launch a probe unless one is in flight, long cooldown
//!
//! Ticks for one court are serialized across processes by a tick lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::courts::CourtRegistry;
use crate::coordination::{Coordinator, Mark, RetryPolicy};
use crate::error::SweepError;
use crate::metrics;
use crate::queue::{Job, JobQueue, QueueDepth, QueueThrottle};
use crate::storage::CaseStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cooldown after a crawl was issued or `final` moved.
    pub short_wait: Duration,
    /// Cooldown after a probe was launched or found in flight.
    pub long_wait: Duration,
    pub probe_semaphore_ttl: Duration,
    pub tick_lock_ttl: Duration,
    /// Pause between courts within one pass.
    pub court_delay: Duration,
    /// Pause between passes over all courts.
    pub iteration_delay: Duration,
    /// Pause after losing the coordination store.
    pub redis_backoff: Duration,
    /// Consecutive empty probes after which a court is dropped for the run.
    /// Zero disables the rule.
    pub stop_threshold: u32,
    /// Passes to run. Zero runs until shutdown.
    pub iterations: u64,
    /// Remove cooldowns right after each tick, for test runs.
    pub clear_cooldowns: bool,
    /// Queue backlog lower bound. Defaults to twice the number of courts.
    pub throttle_min_items: Option<usize>,
    pub throttle_poll_interval: Duration,
    pub enqueue_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            short_wait: Duration::from_secs(1),
            long_wait: Duration::from_secs(60),
            probe_semaphore_ttl: Duration::from_secs(600),
            tick_lock_ttl: Duration::from_secs(30),
            court_delay: Duration::ZERO,
            iteration_delay: Duration::from_secs(1),
            redis_backoff: Duration::from_secs(10),
            stop_threshold: 0,
            iterations: 0,
            clear_cooldowns: false,
            throttle_min_items: None,
            throttle_poll_interval: Duration::from_secs(5),
            enqueue_retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn throttle_min_items_for(&self, court_count: usize) -> usize {
        self.throttle_min_items
            .unwrap_or(court_count.saturating_mul(2))
            .max(1)
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_clear_cooldowns(mut self, clear: bool) -> Self {
        self.clear_cooldowns = clear;
        self
    }

    pub fn with_enqueue_retry(mut self, retry: RetryPolicy) -> Self {
        self.enqueue_retry = retry;
        self
    }
}

/// What one tick did for a court.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    CoolingDown,
    /// Another scheduler is ticking this court.
    TickLocked,
    /// The court has no `init` mark.
    Unseeded,
    Enqueued { pacer_case_id: i64 },
    FinalAdvanced { from: i64, to: i64 },
    ProbeLaunched,
    ProbeInFlight,
    /// Too many consecutive empty probes.
    Abandoned { empty_probes: i64 },
}

impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::CoolingDown => "cooling_down",
            TickOutcome::TickLocked => "tick_locked",
            TickOutcome::Unseeded => "unseeded",
            TickOutcome::Enqueued { .. } => "enqueued",
            TickOutcome::FinalAdvanced { .. } => "final_advanced",
            TickOutcome::ProbeLaunched => "probe_launched",
            TickOutcome::ProbeInFlight => "probe_in_flight",
            TickOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

/// Totals for one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub iterations: u64,
    pub enqueued: u64,
    pub final_advanced: u64,
    pub probes_launched: u64,
    pub skipped: u64,
    pub errors: u64,
    pub abandoned: Vec<String>,
}

impl SweepSummary {
    fn record(&mut self, court: &str, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Enqueued { .. } => self.enqueued += 1,
            TickOutcome::FinalAdvanced { .. } => self.final_advanced += 1,
            TickOutcome::ProbeLaunched => self.probes_launched += 1,
            TickOutcome::Abandoned { .. } => self.abandoned.push(court.to_string()),
            TickOutcome::CoolingDown
            | TickOutcome::TickLocked
            | TickOutcome::Unseeded
            | TickOutcome::ProbeInFlight => self.skipped += 1,
        }
    }
}

pub struct SweepScheduler {
    coordinator: Coordinator,
    queue: Arc<JobQueue>,
    store: Arc<dyn CaseStore>,
    courts: Arc<CourtRegistry>,
    throttle: QueueThrottle,
    config: SchedulerConfig,
}

impl SweepScheduler {
    pub fn new(
        coordinator: Coordinator,
        queue: Arc<JobQueue>,
        store: Arc<dyn CaseStore>,
        courts: Arc<CourtRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let depth: Arc<dyn QueueDepth> = queue.clone();
        let throttle = QueueThrottle::new(
            depth,
            config.throttle_min_items_for(courts.len()),
            config.throttle_poll_interval,
        );
        Self {
            coordinator,
            queue,
            store,
            courts,
            throttle,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Takes one step for `court`.
    pub async fn tick(&mut self, court: &str) -> Result<TickOutcome, SweepError> {
        let cooldowns = self.coordinator.cooldowns();
        if cooldowns.is_cooling(court).await? {
            return Ok(TickOutcome::CoolingDown);
        }

        // Backpressure before the tick lock, so waiting never holds it.
        self.throttle.maybe_wait().await?;

        let locks = self.coordinator.locks();
        let Some(token) = locks.lock_tick(court, self.config.tick_lock_ttl).await? else {
            debug!(court, "Tick lock held by another scheduler");
            return Ok(TickOutcome::TickLocked);
        };

        let result = match cooldowns.is_cooling(court).await {
            Ok(true) => Ok(TickOutcome::CoolingDown),
            Ok(false) => self.tick_locked(court).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = locks.release_lock(&token).await {
            warn!(court, error = %e, "Failed to release tick lock; it will expire");
        }

        if let Ok(outcome) = &result {
            metrics::record_tick(court, outcome.label());
        }
        result
    }

    async fn tick_locked(&self, court: &str) -> Result<TickOutcome, SweepError> {
        let marks = self.coordinator.watermarks();
        let cooldowns = self.coordinator.cooldowns();

        let Some(init) = marks.try_get(Mark::Init, court).await? else {
            debug!(court, "Court has no starting ID; skipping");
            return Ok(TickOutcome::Unseeded);
        };

        if self.config.stop_threshold > 0 {
            let empty_probes = marks.get(Mark::EmptyProbes, court).await?;
            if empty_probes >= i64::from(self.config.stop_threshold) {
                info!(court, empty_probes, "Too many empty probes; stopping court for this run");
                return Ok(TickOutcome::Abandoned { empty_probes });
            }
        }

        let final_id = marks.get(Mark::Final, court).await?;
        if init < final_id {
            let pacer_case_id = self.enqueue_next(court).await?;
            cooldowns.start(court, self.config.short_wait).await?;
            return Ok(TickOutcome::Enqueued { pacer_case_id });
        }

        if let Some(db_max) = marks.derive_final_from_db(court, self.store.as_ref()).await? {
            if db_max > init {
                cooldowns.start(court, self.config.short_wait).await?;
                return Ok(TickOutcome::FinalAdvanced {
                    from: final_id,
                    to: db_max,
                });
            }
        }

        let locks = self.coordinator.locks();
        if !locks.claim_probe(court, self.config.probe_semaphore_ttl).await? {
            debug!(court, "Probe already in flight");
            cooldowns.start(court, self.config.long_wait).await?;
            return Ok(TickOutcome::ProbeInFlight);
        }

        let job = Job::probe(court);
        let enqueued = self
            .config
            .enqueue_retry
            .run("probe_enqueue", || self.queue.enqueue(&job))
            .await;
        if let Err(e) = enqueued {
            if let Err(release_err) = locks.release_probe(court).await {
                warn!(court, error = %release_err, "Failed to release probe semaphore");
            }
            return Err(e.into());
        }

        metrics::record_probe_launched(court);
        info!(court, init, final_id, "Launched frontier probe");
        cooldowns.start(court, self.config.long_wait).await?;
        Ok(TickOutcome::ProbeLaunched)
    }

    /// Claims the next ID and queues its crawl. The claim is rolled back
    /// when the job cannot be queued.
    async fn enqueue_next(&self, court: &str) -> Result<i64, SweepError> {
        let marks = self.coordinator.watermarks();
        let pacer_case_id = marks.increment(Mark::Init, court, 1).await?;
        let job = Job::sweep_crawl(court, pacer_case_id);

        let enqueued = self
            .config
            .enqueue_retry
            .run("sweep_enqueue", || self.queue.enqueue(&job))
            .await;
        if let Err(e) = enqueued {
            error!(court, pacer_case_id, error = %e, "Enqueue failed; rolling back starting ID");
            if let Err(rollback_err) = marks.increment(Mark::Init, court, -1).await {
                error!(
                    court,
                    pacer_case_id,
                    error = %rollback_err,
                    "Rollback of starting ID failed"
                );
            }
            return Err(e.into());
        }

        metrics::record_sweep_enqueue(court);
        info!(court, pacer_case_id, "Enqueued sweep crawl");
        Ok(pacer_case_id)
    }

    /// Runs passes over all courts until the iteration budget is spent, every
    /// court was dropped, or `shutdown` turns true.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SweepSummary, SweepError> {
        let mut summary = SweepSummary::default();
        if let Err(e) = self.courts.refresh_if_stale().await {
            warn!(error = %e, "Failed to list courts; keeping the current list");
        }
        while let Err(e) = self.start_up().await {
            if !e.is_connection() {
                return Err(e);
            }
            summary.errors += 1;
            self.back_off("start_up", &e, &mut shutdown).await;
            if *shutdown.borrow() {
                return Ok(summary);
            }
        }

        let cooldowns = self.coordinator.cooldowns();
        // Courts left out for the rest of this run.
        let mut dropped: HashSet<String> = HashSet::new();
        let mut resync_throttle = false;

        info!(
            courts = self.courts.len(),
            iterations = self.config.iterations,
            stop_threshold = self.config.stop_threshold,
            "Sweep scheduler started"
        );

        'passes: loop {
            if *shutdown.borrow() {
                break;
            }

            match self.courts.refresh_if_stale().await {
                Ok(true) => {
                    // An unseeded court may have been seeded since.
                    dropped.retain(|c| summary.abandoned.contains(c));
                    resync_throttle = true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to refresh court list; keeping the current one")
                }
            }
            if resync_throttle {
                let min_items = self.config.throttle_min_items_for(self.courts.len());
                match self.throttle.update_min_items(min_items).await {
                    Ok(()) => resync_throttle = false,
                    Err(e) => {
                        let e = SweepError::from(e);
                        summary.errors += 1;
                        if e.is_connection() {
                            self.back_off("throttle", &e, &mut shutdown).await;
                        } else {
                            warn!(error = %e, "Failed to resize queue throttle; keeping old bounds")
                        }
                    }
                }
            }

            let active: Vec<String> = self
                .courts
                .courts()
                .into_iter()
                .filter(|c| !dropped.contains(c))
                .collect();
            if active.is_empty() {
                info!("No courts left to sweep");
                break;
            }

            for court in &active {
                if *shutdown.borrow() {
                    break 'passes;
                }

                match self.tick(court).await {
                    Ok(outcome) => {
                        summary.record(court, &outcome);
                        if matches!(
                            outcome,
                            TickOutcome::Abandoned { .. } | TickOutcome::Unseeded
                        ) {
                            dropped.insert(court.clone());
                        }
                        if self.config.clear_cooldowns {
                            if let Err(e) = cooldowns.clear(court).await {
                                warn!(court = %court, error = %e, "Failed to clear cooldown");
                            }
                        }
                    }
                    Err(e) if e.is_connection() => {
                        summary.errors += 1;
                        warn!(court = %court, "Tick lost the coordination store");
                        self.back_off("tick", &e, &mut shutdown).await;
                    }
                    Err(e) => {
                        summary.errors += 1;
                        error!(court = %court, error = %e, "Tick failed");
                    }
                }

                pause(self.config.court_delay, &mut shutdown).await;
            }

            summary.iterations += 1;
            if let Ok(depth) = self.queue.len().await {
                metrics::set_queue_depth(self.queue.queue_name(), depth);
            }
            if self.config.iterations > 0 && summary.iterations >= self.config.iterations {
                break;
            }
            pause(self.config.iteration_delay, &mut shutdown).await;
        }

        info!(
            iterations = summary.iterations,
            enqueued = summary.enqueued,
            probes_launched = summary.probes_launched,
            errors = summary.errors,
            "Sweep scheduler stopped"
        );
        Ok(summary)
    }
}

impl SweepScheduler {
    /// Sizes the queue throttle and clears the empty-probe counters.
    async fn start_up(&mut self) -> Result<(), SweepError> {
        let min_items = self.config.throttle_min_items_for(self.courts.len());
        self.throttle.update_min_items(min_items).await?;
        let marks = self.coordinator.watermarks();
        for court in self.courts.courts() {
            marks.reset_empty_probes(&court).await?;
        }
        Ok(())
    }

    async fn back_off(
        &self,
        stage: &'static str,
        error: &SweepError,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        metrics::record_coordination_error(stage);
        warn!(
            stage,
            error = %error,
            backoff_secs = self.config.redis_backoff.as_secs(),
            "Lost the coordination store; backing off"
        );
        pause(self.config.redis_backoff, shutdown).await;
    }
}

/// Sleeps for `duration`, returning early if shutdown is signalled.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        changed = shutdown.changed() => {
            // A dropped sender can never signal; sleep out the pause.
            if changed.is_err() {
                tokio::time::sleep(duration).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{keys, KeyValueBackend, MemoryBackend};
    use crate::queue::JobKind;
    use crate::storage::MemoryCaseStore;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        coordinator: Coordinator,
        queue: Arc<JobQueue>,
        store: Arc<MemoryCaseStore>,
        scheduler: SweepScheduler,
    }

    async fn fixture(courts: &[&str], config: SchedulerConfig) -> Fixture {
        fixture_with_refresh(courts, config, Duration::from_secs(3600)).await
    }

    async fn fixture_with_refresh(
        courts: &[&str],
        config: SchedulerConfig,
        refresh_interval: Duration,
    ) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = Coordinator::new(backend.clone()).with_retry(RetryPolicy::none());
        let queue = Arc::new(JobQueue::from_backend(backend.clone(), "iquery"));
        let store = Arc::new(MemoryCaseStore::with_courts(courts.iter().copied()));
        let registry = Arc::new(CourtRegistry::new(store.clone(), refresh_interval));
        registry.refresh_courts().await.unwrap();
        let scheduler = SweepScheduler::new(
            coordinator.clone(),
            queue.clone(),
            store.clone(),
            registry,
            config.with_enqueue_retry(RetryPolicy::none()),
        );
        Fixture {
            backend,
            coordinator,
            queue,
            store,
            scheduler,
        }
    }

    async fn pending_jobs(queue: &JobQueue) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Some(job) = queue.dequeue(Duration::ZERO).await.unwrap() {
            queue.complete(job.id).await.unwrap();
            jobs.push(job);
        }
        jobs
    }

    async fn seed(coordinator: &Coordinator, court: &str, init: i64, final_id: i64) {
        let marks = coordinator.watermarks();
        marks.set(Mark::Init, court, init).await.unwrap();
        marks.set(Mark::Final, court, final_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_enqueues_next_id() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        seed(&f.coordinator, "abc", 100, 150).await;

        let outcome = f.scheduler.tick("abc").await.unwrap();
        assert_eq!(outcome, TickOutcome::Enqueued { pacer_case_id: 101 });

        let marks = f.coordinator.watermarks();
        assert_eq!(marks.get(Mark::Init, "abc").await.unwrap(), 101);
        assert_eq!(marks.get(Mark::Final, "abc").await.unwrap(), 150);

        let remaining = f.coordinator.cooldowns().remaining("abc").await.unwrap();
        assert!(remaining.is_some_and(|r| r <= Duration::from_secs(1)));

        let jobs = pending_jobs(&f.queue).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].kind,
            JobKind::Crawl {
                court: "abc".to_string(),
                pacer_case_id: 101,
                skip_sweep: true
            }
        );
    }

    #[tokio::test]
    async fn test_caught_up_takes_final_from_database() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        seed(&f.coordinator, "abc", 150, 150).await;
        f.store.insert_case("abc", 200);

        let outcome = f.scheduler.tick("abc").await.unwrap();
        assert_eq!(outcome, TickOutcome::FinalAdvanced { from: 150, to: 200 });
        assert_eq!(
            f.coordinator.watermarks().get(Mark::Final, "abc").await.unwrap(),
            200
        );
        assert!(f.queue.is_empty().await.unwrap());
        assert!(f.coordinator.cooldowns().is_cooling("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_caught_up_launches_one_probe() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        seed(&f.coordinator, "abc", 200, 200).await;
        f.store.insert_case("abc", 200);

        let outcome = f.scheduler.tick("abc").await.unwrap();
        assert_eq!(outcome, TickOutcome::ProbeLaunched);
        assert!(f.coordinator.locks().probe_in_flight("abc").await.unwrap());

        let remaining = f.coordinator.cooldowns().remaining("abc").await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(30));

        let jobs = pending_jobs(&f.queue).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Probe { court: "abc".to_string() });

        // Once the cooldown is gone the semaphore still blocks a second probe.
        f.coordinator.cooldowns().clear("abc").await.unwrap();
        assert_eq!(f.scheduler.tick("abc").await.unwrap(), TickOutcome::ProbeInFlight);
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_cooling_court_is_skipped() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        seed(&f.coordinator, "abc", 100, 150).await;
        f.coordinator
            .cooldowns()
            .start("abc", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(f.scheduler.tick("abc").await.unwrap(), TickOutcome::CoolingDown);
        assert_eq!(f.coordinator.watermarks().get(Mark::Init, "abc").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_held_tick_lock_is_skipped() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        seed(&f.coordinator, "abc", 100, 150).await;
        let token = f
            .coordinator
            .locks()
            .lock_tick("abc", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.scheduler.tick("abc").await.unwrap(), TickOutcome::TickLocked);
        f.coordinator.locks().release_lock(&token).await.unwrap();
        assert!(matches!(
            f.scheduler.tick("abc").await.unwrap(),
            TickOutcome::Enqueued { .. }
        ));
    }

    #[tokio::test]
    async fn test_unseeded_court_is_skipped() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        f.store.insert_case("abc", 900);
        assert_eq!(f.scheduler.tick("abc").await.unwrap(), TickOutcome::Unseeded);
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_enqueue_rolls_back_init() {
        let mut f = fixture(&["abc"], SchedulerConfig::default()).await;
        seed(&f.coordinator, "abc", 100, 150).await;

        // exists, set_nx, exists, hget init, hget final, hincrby; then lpush fails.
        f.backend.inject_connection_failures_after(6, 1);
        let err = f.scheduler.tick("abc").await.unwrap_err();
        assert!(err.is_connection());

        let marks = f.coordinator.watermarks();
        assert_eq!(marks.get(Mark::Init, "abc").await.unwrap(), 100);
        assert!(f.queue.is_empty().await.unwrap());
        assert!(!f.coordinator.cooldowns().is_cooling("abc").await.unwrap());
        assert!(!f.backend.exists(&keys::tick_lock("abc")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_threshold_abandons_court() {
        let config = SchedulerConfig {
            stop_threshold: 2,
            ..SchedulerConfig::default()
        };
        let mut f = fixture(&["abc"], config).await;
        seed(&f.coordinator, "abc", 100, 150).await;
        f.coordinator
            .watermarks()
            .set(Mark::EmptyProbes, "abc", 2)
            .await
            .unwrap();

        assert_eq!(
            f.scheduler.tick("abc").await.unwrap(),
            TickOutcome::Abandoned { empty_probes: 2 }
        );
    }

    #[tokio::test]
    async fn test_bounded_run_sweeps_every_court() {
        let config = SchedulerConfig {
            iteration_delay: Duration::ZERO,
            ..SchedulerConfig::default()
        }
        .with_iterations(3)
        .with_clear_cooldowns(true);
        let mut f = fixture(&["abc", "xyz"], config).await;
        seed(&f.coordinator, "abc", 10, 12).await;
        seed(&f.coordinator, "xyz", 50, 60).await;

        let (_tx, rx) = watch::channel(false);
        let summary = f.scheduler.run(rx).await.unwrap();
        assert_eq!(summary.iterations, 3);
        // abc catches up after two passes, then goes to the database and finds nothing.
        assert_eq!(summary.enqueued, 5);
        assert_eq!(summary.probes_launched, 1);

        let marks = f.coordinator.watermarks();
        assert_eq!(marks.get(Mark::Init, "abc").await.unwrap(), 12);
        assert_eq!(marks.get(Mark::Init, "xyz").await.unwrap(), 53);
    }

    #[tokio::test]
    async fn test_run_resets_empty_probes_then_uses_them() {
        let config = SchedulerConfig {
            stop_threshold: 1,
            iteration_delay: Duration::ZERO,
            ..SchedulerConfig::default()
        }
        .with_iterations(2)
        .with_clear_cooldowns(true);
        let mut f = fixture(&["abc"], config).await;
        seed(&f.coordinator, "abc", 10, 11).await;
        f.coordinator
            .watermarks()
            .set(Mark::EmptyProbes, "abc", 5)
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let summary = f.scheduler.run(rx).await.unwrap();
        assert_eq!(summary.enqueued, 1);
        assert!(summary.abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_all_courts_abandoned() {
        let config = SchedulerConfig {
            stop_threshold: 1,
            iteration_delay: Duration::from_millis(1),
            ..SchedulerConfig::default()
        }
        .with_clear_cooldowns(true);
        let mut f = fixture(&["abc"], config).await;
        seed(&f.coordinator, "abc", 10, 10).await;

        // The probe job is never run here, so record its empty result directly.
        let coordinator = f.coordinator.clone();
        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { f.scheduler.run(rx).await.unwrap() });
        for _ in 0..100 {
            if coordinator.locks().probe_in_flight("abc").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        coordinator.watermarks().record_empty_probe("abc").await.unwrap();
        coordinator.locks().release_probe("abc").await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.abandoned, vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_infinite_run() {
        let config = SchedulerConfig {
            iteration_delay: Duration::from_secs(3600),
            ..SchedulerConfig::default()
        };
        let mut f = fixture(&["abc"], config).await;
        seed(&f.coordinator, "abc", 10, 20).await;

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { f.scheduler.run(rx).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.enqueued, 1);
    }

    #[tokio::test]
    async fn test_connection_loss_is_survived() {
        let config = SchedulerConfig {
            iteration_delay: Duration::ZERO,
            redis_backoff: Duration::from_millis(1),
            ..SchedulerConfig::default()
        }
        .with_iterations(2)
        .with_clear_cooldowns(true);
        let mut f = fixture(&["abc"], config).await;
        seed(&f.coordinator, "abc", 10, 20).await;

        // Start-up reads the queue depth (four lists) and resets one court;
        // the first tick command then fails.
        f.backend.inject_connection_failures_after(5, 1);
        let (_tx, rx) = watch::channel(false);
        let summary = f.scheduler.run(rx).await.unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.enqueued, 1);
    }

    #[tokio::test]
    async fn test_start_up_retries_after_connection_loss() {
        let config = SchedulerConfig {
            iteration_delay: Duration::ZERO,
            redis_backoff: Duration::from_millis(1),
            ..SchedulerConfig::default()
        }
        .with_iterations(1);
        let mut f = fixture(&["abc"], config).await;
        seed(&f.coordinator, "abc", 10, 20).await;
        f.coordinator
            .watermarks()
            .set(Mark::EmptyProbes, "abc", 4)
            .await
            .unwrap();

        // The first queue-depth read fails.
        f.backend.inject_connection_failures(1);
        let (_tx, rx) = watch::channel(false);
        let summary = f.scheduler.run(rx).await.unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(
            f.coordinator.watermarks().get(Mark::EmptyProbes, "abc").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_run_survives_one_failure_at_any_command() {
        for skip in 0..40 {
            let config = SchedulerConfig {
                iteration_delay: Duration::ZERO,
                redis_backoff: Duration::from_millis(1),
                ..SchedulerConfig::default()
            }
            .with_iterations(3)
            .with_clear_cooldowns(true);
            // A zero refresh interval resizes the throttle on every pass.
            let mut f = fixture_with_refresh(&["abc", "xyz"], config, Duration::ZERO).await;
            seed(&f.coordinator, "abc", 10, 20).await;
            seed(&f.coordinator, "xyz", 50, 60).await;

            f.backend.inject_connection_failures_after(skip, 1);
            let (_tx, rx) = watch::channel(false);
            let summary = f
                .scheduler
                .run(rx)
                .await
                .unwrap_or_else(|e| panic!("run failed with failure after {skip} commands: {e}"));
            assert_eq!(summary.iterations, 3, "failure after {skip} commands");
            assert!(summary.errors <= 1, "failure after {skip} commands");
        }
    }

    #[test]
    fn test_throttle_min_items_defaults_to_twice_courts() {
        let config = SchedulerConfig::default();
        assert_eq!(config.throttle_min_items_for(90), 180);
        assert_eq!(config.throttle_min_items_for(0), 1);

        let config = SchedulerConfig {
            throttle_min_items: Some(25),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.throttle_min_items_for(90), 25);
    }
}
