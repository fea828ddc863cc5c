//! Frontier probing.
//!
//! Locates the highest caselink ID in use for a court, starting from the
//! highest ID already known. The search has two phases:
//!
//! 1. Geometric probes at `start + 2^k (+ jitter)` for `k = 1..=iterations`.
//!    The last hit is a lower bound and the first miss an upper bound.
//! 2. Bisection between the bounds.
//!
//! A probe in either phase checks a window of `gap_tolerance` consecutive IDs
//! and misses only when all of them are absent, so isolated missing IDs
//! (sealed or deleted cases) do not end the search early.
//!
//! Every existence check is one report request, and the total is capped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::report::ReportSource;
use crate::coordination::{Coordinator, Mark};
use crate::error::{CoordinationError, ReportError};
use crate::metrics;
use crate::storage::{CaseStore, DatabaseError, RecordOutcome};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Probe request budget of {0} exhausted")]
    BudgetExhausted(u32),
}

/// Search parameters.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub iterations: u32,
    pub gap_tolerance: u32,
    /// Upper bound of the random offset added to each geometric probe.
    pub jitter: i64,
    pub request_delay: Duration,
    pub max_requests: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            iterations: 9,
            gap_tolerance: 3,
            jitter: 3,
            request_delay: Duration::from_secs(1),
            max_requests: 64,
        }
    }
}

/// An existence check for one caselink ID.
#[async_trait]
pub trait CaseProbe: Send {
    async fn exists(&mut self, pacer_case_id: i64) -> Result<bool, ProbeError>;
}

/// Result of a frontier search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Highest ID found above the start, if any.
    pub highest_found: Option<i64>,
    /// Whether the request budget ran out before the search converged.
    pub budget_exhausted: bool,
}

/// Searches for the highest existing ID above `start`.
pub async fn find_frontier<P>(
    probe: &mut P,
    start: i64,
    config: &ProbeConfig,
) -> Result<SearchResult, ProbeError>
where
    P: CaseProbe + ?Sized,
{
    let offsets = geometric_offsets(config);
    let mut lo = start;

    match search_bounds(probe, start, &offsets, config, &mut lo).await {
        Ok(Some(hi)) => match bisect(probe, &mut lo, hi, config).await {
            Ok(()) => Ok(result(start, lo, false)),
            Err(ProbeError::BudgetExhausted(_)) => Ok(result(start, lo, true)),
            Err(e) => Err(e),
        },
        Ok(None) => Ok(result(start, lo, false)),
        Err(ProbeError::BudgetExhausted(_)) => Ok(result(start, lo, true)),
        Err(e) => Err(e),
    }
}

fn result(start: i64, lo: i64, budget_exhausted: bool) -> SearchResult {
    SearchResult {
        highest_found: (lo > start).then_some(lo),
        budget_exhausted,
    }
}

/// Offsets `2^k + jitter` for each geometric step, non-decreasing.
fn geometric_offsets(config: &ProbeConfig) -> Vec<i64> {
    let mut rng = rand::rng();
    let mut offsets = Vec::with_capacity(config.iterations as usize);
    let mut previous = 0;
    for k in 1..=config.iterations.min(62) {
        let jitter = if config.jitter > 0 {
            rng.random_range(0..=config.jitter)
        } else {
            0
        };
        let offset = ((1i64 << k) + jitter).max(previous + 1);
        offsets.push(offset);
        previous = offset;
    }
    offsets
}

/// Phase one. Raises `lo` to the last hit and returns the first candidate
/// whose whole window is absent, or `None` when every candidate was found.
async fn search_bounds<P>(
    probe: &mut P,
    start: i64,
    offsets: &[i64],
    config: &ProbeConfig,
    lo: &mut i64,
) -> Result<Option<i64>, ProbeError>
where
    P: CaseProbe + ?Sized,
{
    let window = i64::from(config.gap_tolerance.max(1));

    for offset in offsets {
        let candidate = (start + offset).max(*lo + 1);
        match first_in_window(probe, candidate, candidate + window).await? {
            Some(id) => {
                debug!(candidate, found = id, "Geometric probe hit");
                *lo = id;
            }
            None => {
                debug!(candidate, "Geometric probe miss");
                return Ok(Some(candidate));
            }
        }
    }
    Ok(None)
}

/// Phase two. Narrows `(lo, hi)` until they are adjacent; `lo` ends on the
/// highest existing ID found.
async fn bisect<P>(
    probe: &mut P,
    lo: &mut i64,
    mut hi: i64,
    config: &ProbeConfig,
) -> Result<(), ProbeError>
where
    P: CaseProbe + ?Sized,
{
    let window = i64::from(config.gap_tolerance.max(1));

    while hi - *lo > 1 {
        let mid = *lo + (hi - *lo) / 2;
        match first_in_window(probe, mid, (mid + window).min(hi)).await? {
            Some(id) => *lo = id,
            None => hi = mid,
        }
    }
    Ok(())
}

/// First existing ID in `from..to`.
async fn first_in_window<P>(probe: &mut P, from: i64, to: i64) -> Result<Option<i64>, ProbeError>
where
    P: CaseProbe + ?Sized,
{
    for id in from..to {
        if probe.exists(id).await? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Existence checks backed by report requests.
///
/// Found cases are recorded as they are seen so the work is not repeated.
struct ReportProbe<'a> {
    court: &'a str,
    reports: &'a dyn ReportSource,
    store: &'a dyn CaseStore,
    request_delay: Duration,
    max_requests: u32,
    requests: u32,
}

#[async_trait]
impl CaseProbe for ReportProbe<'_> {
    async fn exists(&mut self, pacer_case_id: i64) -> Result<bool, ProbeError> {
        if self.requests >= self.max_requests {
            return Err(ProbeError::BudgetExhausted(self.max_requests));
        }
        if self.requests > 0 && !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        self.requests += 1;
        metrics::record_probe_request(self.court);

        match self.reports.fetch_case(self.court, pacer_case_id).await? {
            Some(report) => {
                let outcome = self.store.record_case(&report).await?;
                if outcome == RecordOutcome::Created {
                    debug!(court = self.court, pacer_case_id, "Probe recorded new case");
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// What one probe run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub court: String,
    pub start: i64,
    pub frontier: Option<i64>,
    pub requests: u32,
    pub budget_exhausted: bool,
    /// Consecutive empty probes for the court after this run.
    pub empty_probes: i64,
}

/// Runs frontier probes and applies their results to the watermarks.
pub struct FrontierProber {
    coordinator: Coordinator,
    reports: Arc<dyn ReportSource>,
    store: Arc<dyn CaseStore>,
    config: ProbeConfig,
}

impl FrontierProber {
    pub fn new(
        coordinator: Coordinator,
        reports: Arc<dyn ReportSource>,
        store: Arc<dyn CaseStore>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            coordinator,
            reports,
            store,
            config,
        }
    }

    /// Probes `court` and releases its probe semaphore afterwards, whether the
    /// probe succeeded or not.
    pub async fn probe(&self, court: &str) -> Result<ProbeOutcome, ProbeError> {
        let result = self.run(court).await;
        if let Err(e) = self.coordinator.locks().release_probe(court).await {
            warn!(court, error = %e, "Failed to release probe semaphore; it will expire");
        }
        result
    }

    async fn run(&self, court: &str) -> Result<ProbeOutcome, ProbeError> {
        let marks = self.coordinator.watermarks();
        let snapshot = marks.snapshot(court).await?;
        let start = snapshot
            .init
            .max(snapshot.final_id)
            .max(snapshot.highest_known);

        info!(court, start, "Probing for new cases");

        let mut probe = ReportProbe {
            court,
            reports: self.reports.as_ref(),
            store: self.store.as_ref(),
            request_delay: self.config.request_delay,
            max_requests: self.config.max_requests,
            requests: 0,
        };
        let search = find_frontier(&mut probe, start, &self.config).await?;
        let requests = probe.requests;

        if search.budget_exhausted {
            warn!(court, requests, "Probe stopped at request budget");
        }

        let empty_probes = match search.highest_found {
            Some(frontier) => {
                marks.raise(Mark::Final, court, frontier).await?;
                marks.raise(Mark::HighestKnown, court, frontier).await?;
                marks.reset_empty_probes(court).await?;
                info!(court, start, frontier, requests, "Probe found new cases");
                0
            }
            None => {
                let count = marks.record_empty_probe(court).await?;
                info!(court, start, requests, empty_probes = count, "Probe found nothing new");
                count
            }
        };
        metrics::record_probe(court, search.highest_found.is_some());

        Ok(ProbeOutcome {
            court: court.to_string(),
            start,
            frontier: search.highest_found,
            requests,
            budget_exhausted: search.budget_exhausted,
            empty_probes,
        })
    }
}
