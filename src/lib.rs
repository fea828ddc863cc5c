//! iquery-sweep: PACER case discovery by sequential caselink ID sweeps.
//!
//! This library provides the per-court sweep scheduler, the frontier probing
//! engine, reactive gap backfill and the Redis coordination primitives they
//! share (watermarks, locks, cooldowns and rate limits).

// Core modules
pub mod backfill;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod probing;
pub mod queue;
pub mod storage;
pub mod sweep;

// Re-export commonly used error types
pub use error::{BackfillError, CoordinationError, ReportError, SweepError};
