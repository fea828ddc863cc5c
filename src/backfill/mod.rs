//! Reactive gap scheduling.
//!
//! When a docket above a court's `highest_known` mark shows up through any
//! path other than the sweep itself, every caselink ID between the sweep
//! cursor and the new docket is queued for crawling right away instead of
//! waiting for the next probe.
//!
//! Two triggers exist:
//!
//! - a newly recorded docket: the docket's own ID already exists, so the gap
//!   stops one short of it (`501..=504` for docket 505 over mark 500)
//! - an operator-supplied fixed target: the target itself is crawled too
//!   (`501..=505`)
//!
//! All jobs queued here are sweep-tagged so recording them never triggers
//! another backfill.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::coordination::{Coordinator, Mark};
use crate::error::BackfillError;
use crate::metrics;
use crate::queue::{Job, JobQueue};
use crate::sweep::CourtRegistry;

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Largest gap scheduled in one go. Bigger gaps are refused.
    pub max_gap: i64,
    /// Delay added between consecutive gap jobs.
    pub spacing: Duration,
    pub lock_ttl: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_gap: 600,
            spacing: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

/// What started a backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepTrigger {
    /// A docket with this ID was recorded.
    Recorded { court: String, pacer_case_id: i64 },
    /// Sweep up to and including `target`.
    Fixed { court: String, target: i64 },
}

impl SweepTrigger {
    pub fn court(&self) -> &str {
        match self {
            SweepTrigger::Recorded { court, .. } | SweepTrigger::Fixed { court, .. } => court,
        }
    }

    /// The ID that becomes the new `highest_known`.
    pub fn incoming(&self) -> i64 {
        match self {
            SweepTrigger::Recorded { pacer_case_id, .. } => *pacer_case_id,
            SweepTrigger::Fixed { target, .. } => *target,
        }
    }

    /// Last ID to crawl.
    fn last_to_schedule(&self) -> i64 {
        match self {
            SweepTrigger::Recorded { pacer_case_id, .. } => pacer_case_id - 1,
            SweepTrigger::Fixed { target, .. } => *target,
        }
    }
}

/// A docket was committed to the case store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocketSaved {
    pub court: String,
    pub pacer_case_id: Option<i64>,
    pub created: bool,
    /// Set when the docket came from a sweep-issued crawl.
    pub skip_sweep: bool,
}

impl DocketSaved {
    pub fn created(court: impl Into<String>, pacer_case_id: i64) -> Self {
        Self {
            court: court.into(),
            pacer_case_id: Some(pacer_case_id),
            created: true,
            skip_sweep: false,
        }
    }

    pub fn with_skip_sweep(mut self, skip_sweep: bool) -> Self {
        self.skip_sweep = skip_sweep;
        self
    }
}

/// Why a saved docket did not start a backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotCreated,
    SweepTagged,
    NoCaseId,
    UnsupportedCourt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackfillOutcome {
    /// Gap jobs `first..=last` were queued.
    Scheduled { first: i64, last: i64, count: u64 },
    /// `highest_known` moved but there was no gap to fill.
    Advanced { highest_known: i64 },
    /// The incoming ID is not above `highest_known`.
    NotHigher { highest_known: i64 },
    /// Another trigger holds the court's lock.
    LockHeld,
    /// The gap exceeded the configured maximum and nothing was queued.
    GapTooLarge { requested: i64, max_gap: i64 },
    Skipped { reason: SkipReason },
}

/// Schedules gap-filling crawls for newly seen dockets.
pub struct SignalBackfill {
    coordinator: Coordinator,
    queue: Arc<JobQueue>,
    courts: Arc<CourtRegistry>,
    config: BackfillConfig,
}

impl SignalBackfill {
    pub fn new(
        coordinator: Coordinator,
        queue: Arc<JobQueue>,
        courts: Arc<CourtRegistry>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            coordinator,
            queue,
            courts,
            config,
        }
    }

    /// Post-commit hook for dockets. Only newly created, untagged dockets
    /// with a caselink ID in a swept court start a backfill.
    pub async fn on_docket_saved(
        &self,
        event: &DocketSaved,
    ) -> Result<BackfillOutcome, BackfillError> {
        let skip = if event.skip_sweep {
            Some(SkipReason::SweepTagged)
        } else if !event.created {
            Some(SkipReason::NotCreated)
        } else if event.pacer_case_id.is_none() {
            Some(SkipReason::NoCaseId)
        } else if !self.courts.contains(&event.court) {
            Some(SkipReason::UnsupportedCourt)
        } else {
            None
        };

        match (skip, event.pacer_case_id) {
            (None, Some(pacer_case_id)) => {
                self.schedule(&SweepTrigger::Recorded {
                    court: event.court.clone(),
                    pacer_case_id,
                })
                .await
            }
            (reason, _) => {
                let reason = reason.unwrap_or(SkipReason::NoCaseId);
                debug!(court = %event.court, ?reason, "Docket does not trigger a backfill");
                Ok(BackfillOutcome::Skipped { reason })
            }
        }
    }

    /// Runs a backfill under the court's lock. A held lock means another
    /// trigger is already doing this work.
    pub async fn schedule(&self, trigger: &SweepTrigger) -> Result<BackfillOutcome, BackfillError> {
        let court = trigger.court();
        let locks = self.coordinator.locks();
        let Some(token) = locks.lock_backfill(court, self.config.lock_ttl).await? else {
            info!(court, incoming = trigger.incoming(), "Backfill lock held; skipping trigger");
            return Ok(BackfillOutcome::LockHeld);
        };

        let result = self.schedule_locked(trigger).await;

        if let Err(e) = locks.release_lock(&token).await {
            warn!(court, error = %e, "Failed to release backfill lock; it will expire");
        }
        result
    }

    async fn schedule_locked(
        &self,
        trigger: &SweepTrigger,
    ) -> Result<BackfillOutcome, BackfillError> {
        let court = trigger.court();
        let incoming = trigger.incoming();
        let marks = self.coordinator.watermarks();

        let highest_known = marks.get(Mark::HighestKnown, court).await?;
        if incoming <= highest_known {
            debug!(court, incoming, highest_known, "Incoming ID is not new");
            return Ok(BackfillOutcome::NotHigher { highest_known });
        }

        let cursor = marks.get(Mark::SweepCursor, court).await?;
        let start = cursor.max(highest_known);
        let last = trigger.last_to_schedule();
        let requested = last - start;

        if requested > self.config.max_gap {
            error!(
                court,
                requested,
                max_gap = self.config.max_gap,
                cursor,
                highest_known,
                incoming,
                "Backfill gap too large; aborting to protect the queue"
            );
            return Ok(BackfillOutcome::GapTooLarge {
                requested,
                max_gap: self.config.max_gap,
            });
        }

        if requested <= 0 {
            marks.raise(Mark::HighestKnown, court, incoming).await?;
            info!(court, incoming, "Raised highest known ID; no gap to fill");
            return Ok(BackfillOutcome::Advanced {
                highest_known: incoming,
            });
        }

        info!(court, first = start + 1, last, count = requested, "Scheduling backfill");

        let retry = self.coordinator.retry_policy();
        let mut delay = Duration::ZERO;
        for pacer_case_id in (start + 1)..=last {
            delay += self.config.spacing;
            let job = Job::sweep_crawl(court, pacer_case_id);
            let enqueued = retry
                .run("backfill_enqueue", || self.queue.enqueue_in(&job, delay))
                .await;
            if let Err(e) = enqueued {
                // Keep what was queued so the next trigger resumes after it.
                let scheduled = pacer_case_id - 1 - start;
                if scheduled > 0 {
                    marks.set(Mark::SweepCursor, court, pacer_case_id - 1).await?;
                    metrics::record_backfill(court, scheduled as u64);
                }
                error!(court, pacer_case_id, scheduled, error = %e, "Backfill enqueue failed");
                return Err(e.into());
            }
            debug!(court, pacer_case_id, delay_ms = delay.as_millis() as u64, "Queued gap crawl");
        }

        marks.set(Mark::SweepCursor, court, last).await?;
        marks.raise(Mark::HighestKnown, court, incoming).await?;
        metrics::record_backfill(court, requested as u64);

        Ok(BackfillOutcome::Scheduled {
            first: start + 1,
            last,
            count: requested as u64,
        })
    }
}
