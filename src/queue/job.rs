//! Job definitions for the iquery queue.
//!
//! - `JobKind`: what a worker should do (crawl one caselink ID, or probe)
//! - `Priority`: which priority sub-list a job is pushed to
//! - `Job`: a queued unit of work with its attempt bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordination::keys::PRIORITY_STEPS;

/// Default maximum number of attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Work carried by a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch the case report for one caselink ID and record it.
    Crawl {
        court: String,
        pacer_case_id: i64,
        /// Set on jobs issued by a sweep so that recording the case does not
        /// trigger another backfill.
        #[serde(default)]
        skip_sweep: bool,
    },
    /// Search for the live frontier of a court's ID sequence.
    Probe { court: String },
}

/// Priority sub-list of a queue. Lower steps are served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Default,
    Low,
    Lower,
    Lowest,
}

impl Priority {
    /// Step suffix used in the sub-list name.
    pub fn step(self) -> u8 {
        match self {
            Priority::Default => PRIORITY_STEPS[0],
            Priority::Low => PRIORITY_STEPS[1],
            Priority::Lower => PRIORITY_STEPS[2],
            Priority::Lowest => PRIORITY_STEPS[3],
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority: Priority::Default,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// A crawl job for one caselink ID.
    pub fn crawl(court: impl Into<String>, pacer_case_id: i64) -> Self {
        Self::new(JobKind::Crawl {
            court: court.into(),
            pacer_case_id,
            skip_sweep: false,
        })
    }

    /// A crawl job issued by a sweep, tagged so it never starts another one.
    pub fn sweep_crawl(court: impl Into<String>, pacer_case_id: i64) -> Self {
        Self::new(JobKind::Crawl {
            court: court.into(),
            pacer_case_id,
            skip_sweep: true,
        })
    }

    pub fn probe(court: impl Into<String>) -> Self {
        Self::new(JobKind::Probe {
            court: court.into(),
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn court(&self) -> &str {
        match &self.kind {
            JobKind::Crawl { court, .. } | JobKind::Probe { court } => court,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            JobKind::Crawl { .. } => "crawl",
            JobKind::Probe { .. } => "probe",
        }
    }

    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Gives back the attempt taken for a run that was only rescheduled.
    pub fn refund_attempt(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
