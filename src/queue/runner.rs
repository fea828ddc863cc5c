//! Job execution.
//!
//! A crawl job fetches one case report and records it. Crawls share a
//! per-court rate limit; a crawl over the limit is not run but handed back
//! with the delay after which it may try again. A probe job runs the
//! frontier search for its court.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::job::{Job, JobKind};
use crate::backfill::{DocketSaved, SignalBackfill};
use crate::coordination::{keys, Coordinator, Mark, Rate};
use crate::error::{CoordinationError, ReportError};
use crate::metrics;
use crate::probing::{FrontierProber, ProbeError, ProbeOutcome, ReportSource};
use crate::storage::{CaseStore, DatabaseError, RecordOutcome};

/// Throttle name shared by every crawl, keyed per court.
pub const CRAWL_TASK_NAME: &str = "iquery_crawl";

// Raising `highest_known` shares the court's backfill lock.
const MARK_LOCK_TTL: Duration = Duration::from_secs(10);
const MARK_LOCK_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Whether running the job again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Coordination(e) => e.is_connection(),
            JobError::Report(e) => e.is_transient(),
            JobError::Database(_) | JobError::Timeout(_) => true,
            JobError::Probe(_) => false,
        }
    }
}

/// What a finished job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Recorded { created: bool },
    NotFound,
    /// Rate limited; run again after the delay.
    Deferred(Duration),
    Probed(ProbeOutcome),
}

impl JobOutcome {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Recorded { created: true } => "created",
            JobOutcome::Recorded { created: false } => "merged",
            JobOutcome::NotFound => "not_found",
            JobOutcome::Deferred(_) => "deferred",
            JobOutcome::Probed(_) => "probed",
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, JobError>;
}

/// Runs crawl and probe jobs against the report endpoint and case store.
pub struct JobRunner {
    coordinator: Coordinator,
    reports: Arc<dyn ReportSource>,
    store: Arc<dyn CaseStore>,
    prober: Arc<FrontierProber>,
    backfill: Option<Arc<SignalBackfill>>,
    crawl_rate: Rate,
}

impl JobRunner {
    pub fn new(
        coordinator: Coordinator,
        reports: Arc<dyn ReportSource>,
        store: Arc<dyn CaseStore>,
        prober: Arc<FrontierProber>,
        crawl_rate: Rate,
    ) -> Self {
        Self {
            coordinator,
            reports,
            store,
            prober,
            backfill: None,
            crawl_rate,
        }
    }

    /// Triggers reactive backfill for dockets created by untagged crawls.
    pub fn with_backfill(mut self, backfill: Arc<SignalBackfill>) -> Self {
        self.backfill = Some(backfill);
        self
    }

    async fn crawl(
        &self,
        court: &str,
        pacer_case_id: i64,
        skip_sweep: bool,
    ) -> Result<JobOutcome, JobError> {
        let wait = self
            .coordinator
            .task_throttle()
            .get_task_wait(CRAWL_TASK_NAME, Some(court), self.crawl_rate)
            .await?;
        if !wait.is_zero() {
            debug!(
                court,
                pacer_case_id,
                wait_ms = wait.as_millis() as u64,
                "Crawl deferred by throttle"
            );
            metrics::record_throttle_deferral(court);
            return Ok(JobOutcome::Deferred(wait));
        }

        let Some(report) = self.reports.fetch_case(court, pacer_case_id).await? else {
            debug!(court, pacer_case_id, "No case at caselink ID");
            return Ok(JobOutcome::NotFound);
        };

        let created = self.store.record_case(&report).await? == RecordOutcome::Created;
        info!(
            court,
            pacer_case_id,
            created,
            docket_number = %report.docket_number,
            "Recorded case"
        );

        if created {
            if let Some(backfill) = &self.backfill {
                let event = DocketSaved::created(court, pacer_case_id).with_skip_sweep(skip_sweep);
                // The docket is already stored; a failed backfill must not fail the crawl.
                match backfill.on_docket_saved(&event).await {
                    Ok(outcome) => debug!(court, pacer_case_id, ?outcome, "Backfill hook ran"),
                    Err(e) => {
                        warn!(court, pacer_case_id, error = %e, "Backfill after crawl failed")
                    }
                }
            }
        }

        // After the backfill hook, which compares against the old value.
        if let Err(e) = self.raise_highest_known(court, pacer_case_id).await {
            warn!(court, pacer_case_id, error = %e, "Failed to raise highest known ID");
        }

        Ok(JobOutcome::Recorded { created })
    }

    async fn raise_highest_known(
        &self,
        court: &str,
        pacer_case_id: i64,
    ) -> Result<(), CoordinationError> {
        let locks = self.coordinator.locks();
        let Some(token) = locks
            .acquire_lock(&keys::backfill_lock(court), MARK_LOCK_TTL, MARK_LOCK_WAIT)
            .await?
        else {
            warn!(court, pacer_case_id, "Backfill lock stayed held; highest known ID not raised");
            return Ok(());
        };

        let raised = self
            .coordinator
            .watermarks()
            .raise(Mark::HighestKnown, court, pacer_case_id)
            .await;
        if let Err(e) = locks.release_lock(&token).await {
            warn!(court, error = %e, "Failed to release backfill lock; it will expire");
        }
        raised.map(|_| ())
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, JobError> {
        match &job.kind {
            JobKind::Crawl {
                court,
                pacer_case_id,
                skip_sweep,
            } => self.crawl(court, *pacer_case_id, *skip_sweep).await,
            JobKind::Probe { court } => Ok(JobOutcome::Probed(self.prober.probe(court).await?)),
        }
    }
}
