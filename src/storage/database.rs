//! PostgreSQL docket store.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tracing::debug;

use super::cases::{CaseStore, CourtSource, RecordOutcome};
use super::migrations::MigrationRunner;
use super::schema;
use crate::probing::CaseReport;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<usize, DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }
}

/// First day of `year` and of the following year.
pub(crate) fn year_bounds(year: i32) -> Result<(NaiveDate, NaiveDate), DatabaseError> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1);
    let end = year
        .checked_add(1)
        .and_then(|next| NaiveDate::from_ymd_opt(next, 1, 1));
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(DatabaseError::InvalidArgument(format!("year out of range: {year}"))),
    }
}

#[async_trait]
impl CaseStore for Database {
    async fn max_known_case_id(&self, court: &str) -> Result<Option<i64>, DatabaseError> {
        let max: Option<i64> = sqlx::query_scalar(schema::SELECT_MAX_CASE_ID)
            .bind(court)
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    async fn record_case(&self, report: &CaseReport) -> Result<RecordOutcome, DatabaseError> {
        let row = sqlx::query(schema::UPSERT_DOCKET)
            .bind(&report.court)
            .bind(report.pacer_case_id)
            .bind(&report.docket_number)
            .bind(&report.case_name)
            .bind(report.date_filed)
            .fetch_one(&self.pool)
            .await?;

        let inserted: bool = row.try_get("inserted")?;
        let outcome = if inserted {
            RecordOutcome::Created
        } else {
            RecordOutcome::Merged
        };
        debug!(
            court = %report.court,
            pacer_case_id = report.pacer_case_id,
            ?outcome,
            "Recorded docket"
        );
        Ok(outcome)
    }

    async fn latest_case_id_filed_in_year(
        &self,
        court: &str,
        year: i32,
    ) -> Result<Option<i64>, DatabaseError> {
        let (start, end) = year_bounds(year)?;
        let id: Option<i64> = sqlx::query_scalar(schema::SELECT_LATEST_CASE_ID_FILED_BETWEEN)
            .bind(court)
            .bind(start)
            .bind(end)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl CourtSource for Database {
    async fn list_pacer_courts(&self) -> Result<Vec<String>, DatabaseError> {
        let excluded: Vec<String> = schema::EXCLUDED_COURTS
            .iter()
            .map(|c| c.to_string())
            .collect();
        let courts: Vec<String> = sqlx::query_scalar(schema::SELECT_PACER_COURTS)
            .bind(excluded)
            .fetch_all(&self.pool)
            .await?;
        Ok(courts)
    }
}
