//! Storage interfaces used by the sweep.

use async_trait::async_trait;
use serde::Serialize;

use super::database::DatabaseError;
use crate::probing::CaseReport;

/// Whether recording a case created a new docket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordOutcome {
    Created,
    Merged,
}

/// Persistent docket records.
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Largest caselink ID recorded for `court`.
    async fn max_known_case_id(&self, court: &str) -> Result<Option<i64>, DatabaseError>;

    /// Inserts the case, or merges it into the existing docket.
    async fn record_case(&self, report: &CaseReport) -> Result<RecordOutcome, DatabaseError>;

    /// Caselink ID of the most recently filed case in `year`.
    async fn latest_case_id_filed_in_year(
        &self,
        court: &str,
        year: i32,
    ) -> Result<Option<i64>, DatabaseError>;
}

/// The list of courts the sweep covers.
#[async_trait]
pub trait CourtSource: Send + Sync {
    /// District and bankruptcy courts reachable through PACER.
    async fn list_pacer_courts(&self) -> Result<Vec<String>, DatabaseError>;
}
