//! Repository layer for database operations.
//!
//! Operations are associated functions over a sqlx executor so the same call
//! works against the pool or inside a projection transaction. Grouped by table:
//! - `leaders.rs` - leader registration and denormalized totals
//! - `followers.rs` - follower relationships and balances
//! - `positions.rs` - leader and follower positions
//! - `events.rs` - the append-only event log used by the idempotency guard
//! - `outbox.rs` - durable settlement outbox
//! - `checkpoints.rs` - per-family watcher progress

mod checkpoints;
mod events;
mod followers;
mod leaders;
mod outbox;
mod positions;

pub use events::{EventLogRow, EventRecord};

use crate::domain::Decimal;
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::Transaction;

/// Handle to the SQLite store.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a write transaction. SQLite takes the write lock on the first
    /// write statement, so callers should lead with one.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Cheap liveness probe used by the readiness endpoint.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Decode a canonical decimal TEXT column.
pub(crate) fn decimal_column(raw: &str, column: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str_canonical(raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Repository;
    use crate::db::migrations::init_db;
    use tempfile::TempDir;

    pub async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }
}
