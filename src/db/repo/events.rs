//! Append-only event log.
//!
//! An `applied` row is the durable idempotency claim for an event; the
//! partial unique index on `(event_name, idempotency_key) WHERE status =
//! 'applied'` makes the claim atomic. `failed` rows are audit only.

use crate::domain::{DecodedLog, LeaderId, TimeMs, TxHash};
use sqlx::sqlite::SqliteExecutor;
use sqlx::Row;

use super::Repository;

/// Fields written for one processed event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_name: &'static str,
    pub idempotency_key: String,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub log_index: u64,
    pub leader_id: Option<LeaderId>,
    pub args: serde_json::Value,
}

impl EventRecord {
    pub fn from_decoded(log: &DecodedLog) -> Self {
        EventRecord {
            event_name: log.event.family().name(),
            idempotency_key: log.idempotency_key(),
            tx_hash: log.meta.tx_hash.clone(),
            block_number: log.meta.block_number,
            log_index: log.meta.log_index,
            leader_id: Some(log.event.leader_id()),
            args: log.event.args_json(),
        }
    }
}

/// A stored event log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRow {
    pub id: i64,
    pub event_name: String,
    pub idempotency_key: String,
    pub tx_hash: String,
    pub block_number: i64,
    pub log_index: i64,
    pub leader_id: Option<i64>,
    pub args: String,
    pub status: String,
    pub error: Option<String>,
}

impl Repository {
    /// True if an `applied` row exists for the key within the event family.
    pub async fn is_event_applied<'e, E>(
        executor: E,
        event_name: &str,
        idempotency_key: &str,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM event_log
            WHERE event_name = ? AND idempotency_key = ? AND status = 'applied'
            LIMIT 1
            "#,
        )
        .bind(event_name)
        .bind(idempotency_key)
        .fetch_optional(executor)
        .await?;
        Ok(found.is_some())
    }

    /// Insert the `applied` row. Returns false when another writer already
    /// holds the claim, in which case the caller must not apply the event.
    pub async fn claim_event<'e, E>(
        executor: E,
        record: &EventRecord,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO event_log
            (event_name, idempotency_key, tx_hash, block_number, log_index, leader_id,
             args, status, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'applied', NULL, ?)
            ON CONFLICT(event_name, idempotency_key) WHERE status = 'applied' DO NOTHING
            "#,
        )
        .bind(record.event_name)
        .bind(&record.idempotency_key)
        .bind(record.tx_hash.as_str())
        .bind(record.block_number as i64)
        .bind(record.log_index as i64)
        .bind(record.leader_id.map(|id| id.as_i64()))
        .bind(record.args.to_string())
        .bind(now.as_ms())
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn record_failed_event<'e, E>(
        executor: E,
        record: &EventRecord,
        error: &str,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO event_log
            (event_name, idempotency_key, tx_hash, block_number, log_index, leader_id,
             args, status, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'failed', ?, ?)
            "#,
        )
        .bind(record.event_name)
        .bind(&record.idempotency_key)
        .bind(record.tx_hash.as_str())
        .bind(record.block_number as i64)
        .bind(record.log_index as i64)
        .bind(record.leader_id.map(|id| id.as_i64()))
        .bind(record.args.to_string())
        .bind(error)
        .bind(now.as_ms())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Event log rows for one family in insertion order.
    pub async fn list_events<'e, E>(
        executor: E,
        event_name: &str,
    ) -> Result<Vec<EventLogRow>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id, event_name, idempotency_key, tx_hash, block_number, log_index,
                   leader_id, args, status, error
            FROM event_log
            WHERE event_name = ?
            ORDER BY id ASC
            "#,
        )
        .bind(event_name)
        .fetch_all(executor)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EventLogRow {
                    id: row.try_get("id")?,
                    event_name: row.try_get("event_name")?,
                    idempotency_key: row.try_get("idempotency_key")?,
                    tx_hash: row.try_get("tx_hash")?,
                    block_number: row.try_get("block_number")?,
                    log_index: row.try_get("log_index")?,
                    leader_id: row.try_get("leader_id")?,
                    args: row.try_get("args")?,
                    status: row.try_get("status")?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;

    fn record(key: &str) -> EventRecord {
        EventRecord {
            event_name: "Subscribed",
            idempotency_key: key.to_string(),
            tx_hash: TxHash::new(key.to_string()),
            block_number: 5,
            log_index: 1,
            leader_id: Some(LeaderId::new(1)),
            args: serde_json::json!({ "amount": "100" }),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (repo, _temp) = setup_test_db().await;

        assert!(Repository::claim_event(repo.pool(), &record("0xaa"), TimeMs::new(1))
            .await
            .unwrap());
        assert!(!Repository::claim_event(repo.pool(), &record("0xaa"), TimeMs::new(2))
            .await
            .unwrap());
        assert!(Repository::is_event_applied(repo.pool(), "Subscribed", "0xaa")
            .await
            .unwrap());
        assert!(!Repository::is_event_applied(repo.pool(), "Unsubscribed", "0xaa")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_failed_rows_do_not_satisfy_guard() {
        let (repo, _temp) = setup_test_db().await;

        Repository::record_failed_event(repo.pool(), &record("0xbb"), "boom", TimeMs::new(1))
            .await
            .unwrap();
        Repository::record_failed_event(repo.pool(), &record("0xbb"), "boom", TimeMs::new(2))
            .await
            .unwrap();
        assert!(!Repository::is_event_applied(repo.pool(), "Subscribed", "0xbb")
            .await
            .unwrap());

        let rows = Repository::list_events(repo.pool(), "Subscribed").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].error.as_deref(), Some("boom"));
        assert_eq!(rows[0].args, r#"{"amount":"100"}"#);
    }
}
