//! Durable settlement outbox.
//!
//! Rows are written in the same transaction that closes the leader position,
//! before any chain write. Status moves pending -> submitted -> confirmed, or
//! to failed, from where the sweeper picks it up again.

use crate::domain::{
    Address, LeaderId, NewSettlement, SettlementEntry, SettlementStatus, TimeMs, TxHash,
};
use sqlx::sqlite::{SqliteExecutor, SqliteRow};
use sqlx::Row;

use super::{decimal_column, Repository};

const OUTBOX_COLUMNS: &str = "o.id, o.position_id, o.leader_id, o.follower_address, o.exit_price, \
     o.pnl, o.pnl_fixed, o.status, o.attempts, o.last_error, o.tx_hash";

fn settlement_from_row(row: &SqliteRow) -> Result<SettlementEntry, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(SettlementEntry {
        id: row.try_get("id")?,
        position_id: row.try_get("position_id")?,
        leader_id: LeaderId::from_i64(row.try_get("leader_id")?),
        follower: Address::new(row.try_get("follower_address")?),
        exit_price: decimal_column(&row.try_get::<String, _>("exit_price")?, "exit_price")?,
        pnl: decimal_column(&row.try_get::<String, _>("pnl")?, "pnl")?,
        pnl_fixed: row.try_get("pnl_fixed")?,
        status: SettlementStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: format!("unknown settlement status {}", status).into(),
        })?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        tx_hash: row.try_get::<Option<String>, _>("tx_hash")?.map(TxHash::new),
    })
}

impl Repository {
    /// Persist a settlement. A second enqueue for the same position is ignored.
    pub async fn enqueue_settlement<'e, E>(
        executor: E,
        settlement: &NewSettlement,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO settlement_outbox
            (position_id, leader_id, follower_address, exit_price, pnl, pnl_fixed,
             status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            ON CONFLICT(position_id) DO NOTHING
            "#,
        )
        .bind(settlement.position_id)
        .bind(settlement.leader_id.as_i64())
        .bind(settlement.follower.as_str())
        .bind(settlement.exit_price.to_canonical_string())
        .bind(settlement.pnl.to_canonical_string())
        .bind(&settlement.pnl_fixed)
        .bind(now.as_ms())
        .bind(now.as_ms())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_settlement<'e, E>(
        executor: E,
        id: i64,
    ) -> Result<Option<SettlementEntry>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlement_outbox o WHERE o.id = ?",
            OUTBOX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        row.as_ref().map(settlement_from_row).transpose()
    }

    pub async fn get_settlement_for_position<'e, E>(
        executor: E,
        position_id: i64,
    ) -> Result<Option<SettlementEntry>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM settlement_outbox o WHERE o.position_id = ?",
            OUTBOX_COLUMNS
        ))
        .bind(position_id)
        .fetch_optional(executor)
        .await?;
        row.as_ref().map(settlement_from_row).transpose()
    }

    /// Rows eligible for (re)submission: pending or failed, under the attempt
    /// limit, and whose follower position has not been closed by a
    /// settlement event yet. Optionally restricted to one leader.
    pub async fn pending_settlements<'e, E>(
        executor: E,
        leader_id: Option<LeaderId>,
        max_attempts: i64,
    ) -> Result<Vec<SettlementEntry>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM settlement_outbox o \
             JOIN positions p ON p.id = o.position_id \
             WHERE o.status IN ('pending', 'failed') \
               AND o.attempts < ? \
               AND p.is_open = 1 \
               AND (? IS NULL OR o.leader_id = ?) \
             ORDER BY o.id ASC",
            OUTBOX_COLUMNS
        ))
        .bind(max_attempts)
        .bind(leader_id.map(|id| id.as_i64()))
        .bind(leader_id.map(|id| id.as_i64()))
        .fetch_all(executor)
        .await?;
        rows.iter().map(settlement_from_row).collect()
    }

    /// Rows whose transaction was accepted but never seen confirmed, and whose
    /// position is still open. These are re-polled by hash, never resubmitted.
    pub async fn unconfirmed_settlements<'e, E>(
        executor: E,
        leader_id: Option<LeaderId>,
    ) -> Result<Vec<SettlementEntry>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM settlement_outbox o \
             JOIN positions p ON p.id = o.position_id \
             WHERE o.status = 'submitted' \
               AND o.tx_hash IS NOT NULL \
               AND p.is_open = 1 \
               AND (? IS NULL OR o.leader_id = ?) \
             ORDER BY o.id ASC",
            OUTBOX_COLUMNS
        ))
        .bind(leader_id.map(|id| id.as_i64()))
        .bind(leader_id.map(|id| id.as_i64()))
        .fetch_all(executor)
        .await?;
        rows.iter().map(settlement_from_row).collect()
    }

    /// Count an attempt before the chain write so a crash mid-submission
    /// still consumes one.
    pub async fn begin_settlement_attempt<'e, E>(
        executor: E,
        id: i64,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "UPDATE settlement_outbox SET attempts = attempts + 1, updated_at = ? WHERE id = ?",
        )
        .bind(now.as_ms())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn mark_settlement_submitted<'e, E>(
        executor: E,
        id: i64,
        tx_hash: &TxHash,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            UPDATE settlement_outbox
            SET status = 'submitted', tx_hash = ?, last_error = NULL, updated_at = ?
            WHERE id = ? AND status != 'confirmed'
            "#,
        )
        .bind(tx_hash.as_str())
        .bind(now.as_ms())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn mark_settlement_failed<'e, E>(
        executor: E,
        id: i64,
        error: &str,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            UPDATE settlement_outbox
            SET status = 'failed', last_error = ?, updated_at = ?
            WHERE id = ? AND status != 'confirmed'
            "#,
        )
        .bind(error)
        .bind(now.as_ms())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Record why a submitted row is still unconfirmed without changing its
    /// status.
    pub async fn note_settlement_unconfirmed<'e, E>(
        executor: E,
        id: i64,
        error: &str,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            UPDATE settlement_outbox
            SET last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'submitted'
            "#,
        )
        .bind(error)
        .bind(now.as_ms())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn mark_settlement_confirmed<'e, E>(
        executor: E,
        id: i64,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "UPDATE settlement_outbox SET status = 'confirmed', updated_at = ? WHERE id = ?",
        )
        .bind(now.as_ms())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use crate::domain::{Decimal, Direction, NewPosition};
    use std::str::FromStr;

    async fn open_follower_position(repo: &Repository) -> i64 {
        Repository::ensure_leader(repo.pool(), LeaderId::new(1), TimeMs::new(0))
            .await
            .unwrap();
        Repository::insert_position(
            repo.pool(),
            &NewPosition {
                leader_id: LeaderId::new(1),
                follower: Some(follower()),
                direction: Direction::Long,
                entry_price: Decimal::from_str("3000").unwrap(),
                size_usd: Decimal::from_str("1000").unwrap(),
                index_token: follower(),
                tx_hash: TxHash::new("0x01".to_string()),
                opened_at: TimeMs::new(1),
            },
        )
        .await
        .unwrap()
    }

    fn follower() -> Address {
        Address::from_str("0x00000000000000000000000000000000000000f1").unwrap()
    }

    fn settlement(position_id: i64) -> NewSettlement {
        NewSettlement {
            position_id,
            leader_id: LeaderId::new(1),
            follower: follower(),
            exit_price: Decimal::from_str("3300").unwrap(),
            pnl: Decimal::from_str("100").unwrap(),
            pnl_fixed: "100000000000000000000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_once_per_position() {
        let (repo, _temp) = setup_test_db().await;
        let position_id = open_follower_position(&repo).await;

        assert!(Repository::enqueue_settlement(repo.pool(), &settlement(position_id), TimeMs::new(2))
            .await
            .unwrap());
        assert!(!Repository::enqueue_settlement(repo.pool(), &settlement(position_id), TimeMs::new(3))
            .await
            .unwrap());

        let entry = Repository::get_settlement_for_position(repo.pool(), position_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, SettlementStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.pnl_fixed, "100000000000000000000");
    }

    #[tokio::test]
    async fn test_pending_respects_attempt_limit_and_status() {
        let (repo, _temp) = setup_test_db().await;
        let position_id = open_follower_position(&repo).await;
        Repository::enqueue_settlement(repo.pool(), &settlement(position_id), TimeMs::new(2))
            .await
            .unwrap();
        let id = Repository::get_settlement_for_position(repo.pool(), position_id)
            .await
            .unwrap()
            .unwrap()
            .id;

        Repository::begin_settlement_attempt(repo.pool(), id, TimeMs::new(3))
            .await
            .unwrap();
        Repository::mark_settlement_failed(repo.pool(), id, "nonce too low", TimeMs::new(3))
            .await
            .unwrap();
        let pending = Repository::pending_settlements(repo.pool(), None, 2)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("nonce too low"));

        assert!(Repository::pending_settlements(repo.pool(), None, 1)
            .await
            .unwrap()
            .is_empty());
        assert!(Repository::pending_settlements(repo.pool(), Some(LeaderId::new(2)), 5)
            .await
            .unwrap()
            .is_empty());

        Repository::mark_settlement_submitted(
            repo.pool(),
            id,
            &TxHash::new("0xfeed".to_string()),
            TimeMs::new(4),
        )
        .await
        .unwrap();
        assert!(Repository::pending_settlements(repo.pool(), None, 5)
            .await
            .unwrap()
            .is_empty());

        Repository::mark_settlement_confirmed(repo.pool(), id, TimeMs::new(5))
            .await
            .unwrap();
        Repository::mark_settlement_failed(repo.pool(), id, "late", TimeMs::new(6))
            .await
            .unwrap();
        let entry = Repository::get_settlement(repo.pool(), id).await.unwrap().unwrap();
        assert_eq!(entry.status, SettlementStatus::Confirmed);
        assert_eq!(entry.tx_hash, Some(TxHash::new("0xfeed".to_string())));
    }

    #[tokio::test]
    async fn test_unconfirmed_rows_keep_status_and_hash() {
        let (repo, _temp) = setup_test_db().await;
        let position_id = open_follower_position(&repo).await;
        Repository::enqueue_settlement(repo.pool(), &settlement(position_id), TimeMs::new(2))
            .await
            .unwrap();
        let id = Repository::get_settlement_for_position(repo.pool(), position_id)
            .await
            .unwrap()
            .unwrap()
            .id;
        assert!(Repository::unconfirmed_settlements(repo.pool(), None)
            .await
            .unwrap()
            .is_empty());

        Repository::begin_settlement_attempt(repo.pool(), id, TimeMs::new(3))
            .await
            .unwrap();
        Repository::mark_settlement_submitted(
            repo.pool(),
            id,
            &TxHash::new("0xbeef".to_string()),
            TimeMs::new(3),
        )
        .await
        .unwrap();
        Repository::note_settlement_unconfirmed(repo.pool(), id, "no receipt yet", TimeMs::new(4))
            .await
            .unwrap();

        let unconfirmed = Repository::unconfirmed_settlements(repo.pool(), Some(LeaderId::new(1)))
            .await
            .unwrap();
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].status, SettlementStatus::Submitted);
        assert_eq!(unconfirmed[0].tx_hash, Some(TxHash::new("0xbeef".to_string())));
        assert_eq!(unconfirmed[0].last_error.as_deref(), Some("no receipt yet"));
        assert!(Repository::pending_settlements(repo.pool(), None, 5)
            .await
            .unwrap()
            .is_empty());

        Repository::mark_settlement_confirmed(repo.pool(), id, TimeMs::new(5))
            .await
            .unwrap();
        assert!(Repository::unconfirmed_settlements(repo.pool(), None)
            .await
            .unwrap()
            .is_empty());
    }
}
