//! Seeding sweep bounds from the case store.

use serde::Serialize;
use tracing::{info, warn};

use crate::coordination::{Coordinator, Mark};
use crate::error::SweepError;
use crate::storage::CaseStore;

/// Result of a seeding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    /// Courts seeded, with the ID both bounds were set to.
    pub seeded: Vec<(String, i64)>,
    /// Courts with no case filed in the year; their bounds were removed.
    pub cleared: Vec<String>,
}

/// Sets `init = final` to the caselink ID of each court's most recently
/// filed case in `year`. Courts without one lose their bounds, which makes
/// the scheduler skip them.
pub async fn seed_watermarks(
    coordinator: &Coordinator,
    store: &dyn CaseStore,
    courts: &[String],
    year: i32,
) -> Result<SeedReport, SweepError> {
    let marks = coordinator.watermarks();
    let mut report = SeedReport::default();

    for court in courts {
        match store.latest_case_id_filed_in_year(court, year).await? {
            Some(pacer_case_id) => {
                marks.set(Mark::Init, court, pacer_case_id).await?;
                marks.set(Mark::Final, court, pacer_case_id).await?;
                info!(court = %court, pacer_case_id, year, "Seeded sweep bounds");
                report.seeded.push((court.clone(), pacer_case_id));
            }
            None => {
                marks.clear_sweep(court).await?;
                warn!(court = %court, year, "No case filed in year; court will be skipped");
                report.cleared.push(court.clone());
            }
        }
    }

    Ok(report)
}
