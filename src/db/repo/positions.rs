//! Leader and follower position operations.
//!
//! A row with `follower_address IS NULL` is the leader's own position.
//! Partial unique indexes allow at most one open leader position per leader
//! and one open follower position per (leader, follower).

use crate::domain::{Address, Decimal, Direction, LeaderId, NewPosition, Position, TimeMs, TxHash};
use sqlx::sqlite::{SqliteExecutor, SqliteRow};
use sqlx::Row;

use super::{decimal_column, Repository};

const POSITION_COLUMNS: &str = "id, leader_id, follower_address, is_long, entry_price, size_usd, \
     is_open, exit_price, realized_pnl, index_token, tx_hash, opened_at, closed_at";

fn optional_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, sqlx::Error> {
    row.try_get::<Option<String>, _>(column)?
        .map(|raw| decimal_column(&raw, column))
        .transpose()
}

fn position_from_row(row: &SqliteRow) -> Result<Position, sqlx::Error> {
    Ok(Position {
        id: row.try_get("id")?,
        leader_id: LeaderId::from_i64(row.try_get("leader_id")?),
        follower: row
            .try_get::<Option<String>, _>("follower_address")?
            .map(Address::new),
        direction: Direction::from_is_long(row.try_get::<i64, _>("is_long")? != 0),
        entry_price: decimal_column(&row.try_get::<String, _>("entry_price")?, "entry_price")?,
        size_usd: decimal_column(&row.try_get::<String, _>("size_usd")?, "size_usd")?,
        is_open: row.try_get::<i64, _>("is_open")? != 0,
        exit_price: optional_decimal(row, "exit_price")?,
        realized_pnl: optional_decimal(row, "realized_pnl")?,
        index_token: Address::new(row.try_get("index_token")?),
        tx_hash: TxHash::new(row.try_get("tx_hash")?),
        opened_at: TimeMs::new(row.try_get("opened_at")?),
        closed_at: row.try_get::<Option<i64>, _>("closed_at")?.map(TimeMs::new),
    })
}

impl Repository {
    /// Insert an open position and return its surrogate id.
    pub async fn insert_position<'e, E>(
        executor: E,
        position: &NewPosition,
    ) -> Result<i64, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO positions
            (leader_id, follower_address, is_long, entry_price, size_usd, is_open,
             index_token, tx_hash, opened_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)
            "#,
        )
        .bind(position.leader_id.as_i64())
        .bind(position.follower.as_ref().map(|f| f.as_str()))
        .bind(i64::from(position.direction.is_long()))
        .bind(position.entry_price.to_canonical_string())
        .bind(position.size_usd.to_canonical_string())
        .bind(position.index_token.as_str())
        .bind(position.tx_hash.as_str())
        .bind(position.opened_at.as_ms())
        .execute(executor)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_position<'e, E>(executor: E, id: i64) -> Result<Option<Position>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(&format!("SELECT {} FROM positions WHERE id = ?", POSITION_COLUMNS))
            .bind(id)
            .fetch_optional(executor)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    pub async fn find_open_leader_position<'e, E>(
        executor: E,
        leader_id: LeaderId,
    ) -> Result<Option<Position>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM positions \
             WHERE leader_id = ? AND follower_address IS NULL AND is_open = 1",
            POSITION_COLUMNS
        ))
        .bind(leader_id.as_i64())
        .fetch_optional(executor)
        .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    /// Most recent open follower position, by surrogate id.
    pub async fn find_open_follower_position<'e, E>(
        executor: E,
        leader_id: LeaderId,
        follower: &Address,
    ) -> Result<Option<Position>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM positions \
             WHERE leader_id = ? AND follower_address = ? AND is_open = 1 \
             ORDER BY id DESC LIMIT 1",
            POSITION_COLUMNS
        ))
        .bind(leader_id.as_i64())
        .bind(follower.as_str())
        .fetch_optional(executor)
        .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    pub async fn list_open_follower_positions<'e, E>(
        executor: E,
        leader_id: LeaderId,
    ) -> Result<Vec<Position>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions \
             WHERE leader_id = ? AND follower_address IS NOT NULL AND is_open = 1 \
             ORDER BY id ASC",
            POSITION_COLUMNS
        ))
        .bind(leader_id.as_i64())
        .fetch_all(executor)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    /// All positions under a leader, oldest first.
    pub async fn list_positions<'e, E>(
        executor: E,
        leader_id: LeaderId,
    ) -> Result<Vec<Position>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE leader_id = ? ORDER BY id ASC",
            POSITION_COLUMNS
        ))
        .bind(leader_id.as_i64())
        .fetch_all(executor)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    /// Close an open position. Returns false if it was already closed.
    pub async fn close_position<'e, E>(
        executor: E,
        id: i64,
        exit_price: Decimal,
        realized_pnl: Option<Decimal>,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET is_open = 0, exit_price = ?, realized_pnl = ?, closed_at = ?
            WHERE id = ? AND is_open = 1
            "#,
        )
        .bind(exit_price.to_canonical_string())
        .bind(realized_pnl.map(|p| p.to_canonical_string()))
        .bind(now.as_ms())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
