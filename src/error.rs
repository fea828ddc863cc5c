//! Error types shared across the sweep subsystems.
//!
//! Module-local errors (`QueueError`, `DatabaseError`, `ProbeError`, ...) live
//! next to the code that raises them; this module holds the ones that cross
//! module boundaries:
//! - Coordination store (Redis) failures
//! - External report endpoint failures
//! - Scheduler and backfill failures, which aggregate the above

use thiserror::Error;

use crate::queue::QueueError;
use crate::storage::DatabaseError;

/// Errors raised by the coordination store (Redis or the in-memory backend).
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The store could not be reached, or the connection dropped mid-command.
    #[error("Redis connection failed: {0}")]
    Connection(String),

    /// The store answered with an error reply.
    #[error("Redis operation failed: {0}")]
    Redis(redis::RedisError),

    /// A key holds a value of the wrong type for the requested operation.
    #[error("Wrong value type stored at key '{0}'")]
    WrongType(String),

    /// A stored value could not be parsed.
    #[error("Invalid value at key '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

impl CoordinationError {
    /// Returns whether this is a transient connectivity failure that callers
    /// should wait out instead of surfacing.
    pub fn is_connection(&self) -> bool {
        matches!(self, CoordinationError::Connection(_))
    }
}

impl From<redis::RedisError> for CoordinationError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            CoordinationError::Connection(err.to_string())
        } else {
            CoordinationError::Redis(err)
        }
    }
}

/// Errors raised while talking to the PACER report endpoint.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Rate limited by {court} report endpoint")]
    RateLimited { court: String },

    #[error("Report endpoint for {court} returned status {status} for case {case_id}")]
    Status {
        court: String,
        case_id: i64,
        status: u16,
    },

    #[error("Failed to parse report: {0}")]
    Parse(String),
}

impl ReportError {
    /// Returns whether the request may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            ReportError::RequestFailed(_) | ReportError::RateLimited { .. } => true,
            ReportError::Status { status, .. } => *status >= 500,
            ReportError::Parse(_) => false,
        }
    }
}

/// Errors raised by one scheduler tick.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SweepError {
    /// Returns whether the failure came from a lost coordination-store
    /// connection, either directly or through the queue.
    pub fn is_connection(&self) -> bool {
        match self {
            SweepError::Coordination(e) => e.is_connection(),
            SweepError::Queue(QueueError::Coordination(e)) => e.is_connection(),
            _ => false,
        }
    }
}

/// Errors raised while scheduling a reactive backfill.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordination_error_classification() {
        let err = CoordinationError::Connection("refused".to_string());
        assert!(err.is_connection());
        assert!(err.to_string().contains("refused"));

        let err = CoordinationError::WrongType("court_limiter:nysd".to_string());
        assert!(!err.is_connection());
        assert!(err.to_string().contains("court_limiter:nysd"));
    }

    #[test]
    fn test_sweep_error_connection_through_queue() {
        let err = SweepError::Queue(QueueError::Coordination(CoordinationError::Connection(
            "reset by peer".to_string(),
        )));
        assert!(err.is_connection());

        let err = SweepError::Coordination(CoordinationError::InvalidValue {
            key: "pacer_case_id_init".to_string(),
            value: "abc".to_string(),
        });
        assert!(!err.is_connection());
    }

    #[test]
    fn test_report_error_transience() {
        assert!(ReportError::RequestFailed("timeout".to_string()).is_transient());
        assert!(ReportError::RateLimited {
            court: "nysd".to_string()
        }
        .is_transient());
        assert!(ReportError::Status {
            court: "nysd".to_string(),
            case_id: 1,
            status: 503
        }
        .is_transient());
        assert!(!ReportError::Status {
            court: "nysd".to_string(),
            case_id: 1,
            status: 404
        }
        .is_transient());
        assert!(!ReportError::Parse("bad html".to_string()).is_transient());
    }
}
