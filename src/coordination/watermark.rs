//! Per-court caselink ID watermarks.
//!
//! Each mark is a field in a shared hash keyed by court ID. `init` and
//! `final` bound the proactive sweep: IDs up to `init` have been issued for
//! crawling and IDs up to `final` are believed to exist. `highest_known` and
//! the sweep cursor belong to the reactive backfill.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::backend::KeyValueBackend;
use super::keys;
use crate::error::{CoordinationError, SweepError};
use crate::storage::CaseStore;

/// One of the per-court marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Init,
    Final,
    HighestKnown,
    SweepCursor,
    EmptyProbes,
}

impl Mark {
    fn hash(self) -> &'static str {
        match self {
            Mark::Init => keys::INIT_HASH,
            Mark::Final => keys::FINAL_HASH,
            Mark::HighestKnown => keys::HIGHEST_KNOWN_HASH,
            Mark::SweepCursor => keys::SWEEP_CURSOR_HASH,
            Mark::EmptyProbes => keys::EMPTY_PROBES_HASH,
        }
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.hash())
    }
}

/// Point-in-time view of a court's marks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub init: i64,
    #[serde(rename = "final")]
    pub final_id: i64,
    pub highest_known: i64,
    pub sweep_cursor: i64,
    pub empty_probes: i64,
}

impl Watermark {
    /// IDs believed to exist that have not been issued yet.
    pub fn pending(&self) -> i64 {
        (self.final_id - self.init).max(0)
    }
}

/// Typed access to the watermark hashes.
#[derive(Clone)]
pub struct WatermarkStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl WatermarkStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Reads a mark. Missing marks read as 0.
    pub async fn get(&self, mark: Mark, court: &str) -> Result<i64, CoordinationError> {
        Ok(self.try_get(mark, court).await?.unwrap_or(0))
    }

    /// Reads a mark, telling a missing mark apart from 0.
    pub async fn try_get(&self, mark: Mark, court: &str) -> Result<Option<i64>, CoordinationError> {
        match self.backend.hget(mark.hash(), court).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| CoordinationError::InvalidValue {
                    key: format!("{}[{}]", mark.hash(), court),
                    value: raw,
                }),
            None => Ok(None),
        }
    }

    pub async fn set(&self, mark: Mark, court: &str, value: i64) -> Result<(), CoordinationError> {
        self.backend
            .hset(mark.hash(), court, &value.to_string())
            .await
    }

    /// Atomically adds `delta` and returns the new value.
    pub async fn increment(
        &self,
        mark: Mark,
        court: &str,
        delta: i64,
    ) -> Result<i64, CoordinationError> {
        self.backend.hincr(mark.hash(), court, delta).await
    }

    /// Raises a mark to `value` if that is higher. Returns the resulting mark.
    ///
    /// Read and write are separate commands; callers that race on the same
    /// court must hold a lock.
    pub async fn raise(
        &self,
        mark: Mark,
        court: &str,
        value: i64,
    ) -> Result<i64, CoordinationError> {
        let current = self.get(mark, court).await?;
        if value > current {
            self.set(mark, court, value).await?;
            debug!(court, %mark, from = current, to = value, "Raised watermark");
            Ok(value)
        } else {
            Ok(current)
        }
    }

    pub async fn snapshot(&self, court: &str) -> Result<Watermark, CoordinationError> {
        Ok(Watermark {
            init: self.get(Mark::Init, court).await?,
            final_id: self.get(Mark::Final, court).await?,
            highest_known: self.get(Mark::HighestKnown, court).await?,
            sweep_cursor: self.get(Mark::SweepCursor, court).await?,
            empty_probes: self.get(Mark::EmptyProbes, court).await?,
        })
    }

    /// Removes a court's sweep bounds so the scheduler ignores it until seeded.
    pub async fn clear_sweep(&self, court: &str) -> Result<(), CoordinationError> {
        self.backend.hdel(Mark::Init.hash(), court).await?;
        self.backend.hdel(Mark::Final.hash(), court).await?;
        Ok(())
    }

    /// Courts with a seeded `init` mark.
    pub async fn seeded_courts(&self) -> Result<Vec<String>, CoordinationError> {
        self.backend.hkeys(Mark::Init.hash()).await
    }

    /// Reads the highest ID the database knows for `court` and raises `final`
    /// to it. Returns the database value, or `None` when the court has no
    /// rows.
    pub async fn derive_final_from_db(
        &self,
        court: &str,
        store: &dyn CaseStore,
    ) -> Result<Option<i64>, SweepError> {
        let Some(db_max) = store.max_known_case_id(court).await? else {
            return Ok(None);
        };
        let current = self.get(Mark::Final, court).await?;
        if db_max > current {
            self.set(Mark::Final, court, db_max).await?;
            info!(court, from = current, to = db_max, "Advanced final from database");
        }
        Ok(Some(db_max))
    }

    /// Counts one more probe that found nothing new.
    pub async fn record_empty_probe(&self, court: &str) -> Result<i64, CoordinationError> {
        self.increment(Mark::EmptyProbes, court, 1).await
    }

    pub async fn reset_empty_probes(&self, court: &str) -> Result<(), CoordinationError> {
        self.set(Mark::EmptyProbes, court, 0).await
    }
}
