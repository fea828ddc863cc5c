//! Shared harness for the integration tests: an in-memory coordination
//! store, an in-memory docket store and a scripted report endpoint.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use iquery_sweep::backfill::{BackfillConfig, SignalBackfill};
use iquery_sweep::coordination::{Coordinator, MemoryBackend, Rate, RetryPolicy};
use iquery_sweep::error::ReportError;
use iquery_sweep::probing::{CaseReport, FrontierProber, ProbeConfig, ReportSource};
use iquery_sweep::queue::{JobHandler, JobOutcome, JobQueue, JobRunner};
use iquery_sweep::storage::MemoryCaseStore;
use iquery_sweep::sweep::{CourtRegistry, SchedulerConfig, SweepScheduler};

/// Report endpoint answering from a fixed set of existing IDs per court.
#[derive(Default)]
pub struct ScriptedReports {
    cases: Mutex<HashMap<String, BTreeSet<i64>>>,
    requests: Mutex<Vec<(String, i64)>>,
}

impl ScriptedReports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes IDs `first..=last` exist in `court`.
    pub fn with_range(self, court: &str, first: i64, last: i64) -> Self {
        self.cases
            .lock()
            .unwrap()
            .entry(court.to_string())
            .or_default()
            .extend(first..=last);
        self
    }

    pub fn remove(&self, court: &str, pacer_case_id: i64) {
        if let Some(ids) = self.cases.lock().unwrap().get_mut(court) {
            ids.remove(&pacer_case_id);
        }
    }

    pub fn requests(&self) -> Vec<(String, i64)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSource for ScriptedReports {
    async fn fetch_case(
        &self,
        court: &str,
        pacer_case_id: i64,
    ) -> Result<Option<CaseReport>, ReportError> {
        self.requests
            .lock()
            .unwrap()
            .push((court.to_string(), pacer_case_id));
        let exists = self
            .cases
            .lock()
            .unwrap()
            .get(court)
            .is_some_and(|ids| ids.contains(&pacer_case_id));
        Ok(exists.then(|| {
            CaseReport::new(court, pacer_case_id, format!("1:24-cv-{pacer_case_id:05}"))
                .with_case_name(format!("Plaintiff {pacer_case_id} v. Defendant"))
        }))
    }
}

/// Every component of one sweep deployment, wired over in-memory stores.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub coordinator: Coordinator,
    pub queue: Arc<JobQueue>,
    pub store: Arc<MemoryCaseStore>,
    pub reports: Arc<ScriptedReports>,
    pub courts: Arc<CourtRegistry>,
    pub backfill: Arc<SignalBackfill>,
    pub runner: Arc<JobRunner>,
}

impl Harness {
    pub async fn new(courts: &[&str], reports: ScriptedReports) -> Self {
        Self::with_backfill_config(courts, reports, BackfillConfig::default()).await
    }

    pub async fn with_backfill_config(
        courts: &[&str],
        reports: ScriptedReports,
        backfill_config: BackfillConfig,
    ) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = Coordinator::new(backend.clone()).with_retry(RetryPolicy::none());
        let queue = Arc::new(JobQueue::from_backend(backend.clone(), "iquery"));
        let store = Arc::new(MemoryCaseStore::with_courts(courts.iter().copied()));
        let reports = Arc::new(reports);

        let registry = Arc::new(CourtRegistry::new(store.clone(), Duration::from_secs(3600)));
        registry.refresh_courts().await.unwrap();

        let prober = Arc::new(FrontierProber::new(
            coordinator.clone(),
            reports.clone(),
            store.clone(),
            ProbeConfig {
                jitter: 0,
                request_delay: Duration::ZERO,
                ..ProbeConfig::default()
            },
        ));
        let backfill = Arc::new(SignalBackfill::new(
            coordinator.clone(),
            queue.clone(),
            registry.clone(),
            backfill_config,
        ));
        let runner = Arc::new(
            JobRunner::new(
                coordinator.clone(),
                reports.clone(),
                store.clone(),
                prober,
                Rate::new(10_000, Duration::from_secs(60)),
            )
            .with_backfill(backfill.clone()),
        );

        Self {
            backend,
            coordinator,
            queue,
            store,
            reports,
            courts: registry,
            backfill,
            runner,
        }
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> SweepScheduler {
        SweepScheduler::new(
            self.coordinator.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.courts.clone(),
            config.with_enqueue_retry(RetryPolicy::none()),
        )
    }

    /// Runs every pending job to completion, in queue order.
    pub async fn drain(&self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(job) = self.queue.dequeue(Duration::ZERO).await.unwrap() {
            let outcome = self.runner.handle(&job).await.unwrap();
            self.queue.complete(job.id).await.unwrap();
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn seed(&self, court: &str, init: i64, final_id: i64) {
        use iquery_sweep::coordination::Mark;
        let marks = self.coordinator.watermarks();
        marks.set(Mark::Init, court, init).await.unwrap();
        marks.set(Mark::Final, court, final_id).await.unwrap();
    }
}
