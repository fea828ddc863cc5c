//! In-process docket store for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Datelike;

use super::cases::{CaseStore, CourtSource, RecordOutcome};
use super::database::DatabaseError;
use crate::probing::CaseReport;

/// Dockets keyed by `(court, pacer_case_id)`.
#[derive(Debug, Default)]
pub struct MemoryCaseStore {
    cases: Mutex<BTreeMap<(String, i64), CaseReport>>,
    courts: Mutex<BTreeSet<String>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose court list is `courts`.
    pub fn with_courts<I, S>(courts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        store
            .lock_courts()
            .extend(courts.into_iter().map(Into::into));
        store
    }

    /// Adds a bare case with a synthetic docket number.
    pub fn insert_case(&self, court: &str, pacer_case_id: i64) {
        let report = CaseReport::new(court, pacer_case_id, format!("1:00-cv-{pacer_case_id:05}"));
        self.insert_report(report);
    }

    pub fn insert_report(&self, report: CaseReport) {
        self.lock_cases()
            .insert((report.court.clone(), report.pacer_case_id), report);
    }

    pub fn add_court(&self, court: &str) {
        self.lock_courts().insert(court.to_string());
    }

    pub fn remove_court(&self, court: &str) {
        self.lock_courts().remove(court);
    }

    pub fn contains(&self, court: &str, pacer_case_id: i64) -> bool {
        self.lock_cases()
            .contains_key(&(court.to_string(), pacer_case_id))
    }

    pub fn case_count(&self) -> usize {
        self.lock_cases().len()
    }

    fn lock_cases(&self) -> MutexGuard<'_, BTreeMap<(String, i64), CaseReport>> {
        self.cases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_courts(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.courts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn max_known_case_id(&self, court: &str) -> Result<Option<i64>, DatabaseError> {
        Ok(self
            .lock_cases()
            .keys()
            .filter(|(c, _)| c == court)
            .map(|(_, id)| *id)
            .max())
    }

    async fn record_case(&self, report: &CaseReport) -> Result<RecordOutcome, DatabaseError> {
        let mut cases = self.lock_cases();
        let key = (report.court.clone(), report.pacer_case_id);
        match cases.get_mut(&key) {
            Some(existing) => {
                existing.docket_number = report.docket_number.clone();
                if report.case_name.is_some() {
                    existing.case_name = report.case_name.clone();
                }
                if report.date_filed.is_some() {
                    existing.date_filed = report.date_filed;
                }
                Ok(RecordOutcome::Merged)
            }
            None => {
                cases.insert(key, report.clone());
                Ok(RecordOutcome::Created)
            }
        }
    }

    async fn latest_case_id_filed_in_year(
        &self,
        court: &str,
        year: i32,
    ) -> Result<Option<i64>, DatabaseError> {
        Ok(self
            .lock_cases()
            .values()
            .filter(|r| r.court == court)
            .filter_map(|r| r.date_filed.map(|d| (d, r.pacer_case_id)))
            .filter(|(d, _)| d.year() == year)
            .max()
            .map(|(_, id)| id))
    }
}

#[async_trait]
impl CourtSource for MemoryCaseStore {
    async fn list_pacer_courts(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(self.lock_courts().iter().cloned().collect())
    }
}
