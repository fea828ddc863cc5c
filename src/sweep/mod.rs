//! The iquery sweep: per-court scheduling of sequential caselink crawls.

pub mod courts;
pub mod scheduler;
pub mod seed;

pub use courts::CourtRegistry;
pub use scheduler::{SchedulerConfig, SweepScheduler, SweepSummary, TickOutcome};
pub use seed::{seed_watermarks, SeedReport};
