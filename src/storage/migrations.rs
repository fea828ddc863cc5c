//! Schema migrations.
//!
//! Each entry of [`schema::MIGRATIONS`] runs once, inside its own
//! transaction, and is recorded by name in `iquery_sweep_migrations`.

use std::collections::HashSet;

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use super::schema;

const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS iquery_sweep_migrations (
    name VARCHAR(255) PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration statement was rejected; the name is in the message.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// A migration recorded as applied.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration not yet recorded. Returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        sqlx::query(CREATE_LEDGER).execute(&self.pool).await?;
        let done: HashSet<String> = self
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect();

        let mut applied = 0;
        for (name, sql) in schema::MIGRATIONS {
            if done.contains(name) {
                debug!(migration = name, "Already applied");
                continue;
            }
            self.apply(name, sql).await?;
            info!(migration = name, "Applied migration");
            applied += 1;
        }
        Ok(applied)
    }

    /// Applied migrations, oldest first.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        sqlx::query(CREATE_LEDGER).execute(&self.pool).await?;
        let applied = sqlx::query_as::<_, AppliedMigration>(
            "SELECT name, applied_at FROM iquery_sweep_migrations ORDER BY applied_at, name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(applied)
    }

    async fn apply(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{name}: {e}")))?;
        sqlx::query("INSERT INTO iquery_sweep_migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
