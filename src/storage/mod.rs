//! Docket and court storage.
//!
//! - **Database**: PostgreSQL store for dockets and the court list
//! - **MemoryCaseStore**: in-process store with the same interface
//! - **Migrations**: Schema management and versioning

pub mod cases;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;

// Re-export main types for convenience
pub use cases::{CaseStore, CourtSource, RecordOutcome};
pub use database::{Database, DatabaseError};
pub use memory::MemoryCaseStore;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
