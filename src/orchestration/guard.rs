//! Idempotency guard over the event log.

use crate::db::{EventRecord, Repository};
use crate::domain::{EventFamily, TimeMs};
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;

/// Decides whether a delivered event still needs applying.
///
/// `already_processed` is the cheap pre-check that lets redelivered logs skip
/// the write path. The binding decision is `claim`, made inside the
/// projection transaction.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    repo: Arc<Repository>,
}

impl IdempotencyGuard {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    pub async fn already_processed(
        &self,
        family: EventFamily,
        key: &str,
    ) -> Result<bool, sqlx::Error> {
        Repository::is_event_applied(self.repo.pool(), family.name(), key).await
    }

    /// Record the event as applied. Must be the first statement of the
    /// projection transaction; false means a concurrent writer won.
    pub async fn claim(
        conn: &mut SqliteConnection,
        record: &EventRecord,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        Repository::claim_event(conn, record, now).await
    }
}
