//! Command-line interface for iquery-sweep.
//!
//! Provides the scheduler daemon, the worker pool and one-shot operator
//! commands (seeding, backfill, status, probing, migrations).

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
