//! Follower relationship operations.

use crate::domain::{Address, Decimal, Follower, LeaderId, TimeMs};
use sqlx::sqlite::{SqliteExecutor, SqliteRow};
use sqlx::Row;

use super::{decimal_column, Repository};

fn follower_from_row(row: &SqliteRow) -> Result<Follower, sqlx::Error> {
    Ok(Follower {
        leader_id: LeaderId::from_i64(row.try_get("leader_id")?),
        address: Address::new(row.try_get("address")?),
        balance: decimal_column(&row.try_get::<String, _>("balance")?, "balance")?,
        updated_at: TimeMs::new(row.try_get("updated_at")?),
    })
}

impl Repository {
    pub async fn get_follower<'e, E>(
        executor: E,
        leader_id: LeaderId,
        address: &Address,
    ) -> Result<Option<Follower>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(
            r#"
            SELECT leader_id, address, balance, updated_at
            FROM followers
            WHERE leader_id = ? AND address = ?
            "#,
        )
        .bind(leader_id.as_i64())
        .bind(address.as_str())
        .fetch_optional(executor)
        .await?;

        row.as_ref().map(follower_from_row).transpose()
    }

    pub async fn insert_follower<'e, E>(
        executor: E,
        leader_id: LeaderId,
        address: &Address,
        balance: Decimal,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO followers (leader_id, address, balance, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(leader_id.as_i64())
        .bind(address.as_str())
        .bind(balance.to_canonical_string())
        .bind(now.as_ms())
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn set_follower_balance<'e, E>(
        executor: E,
        leader_id: LeaderId,
        address: &Address,
        balance: Decimal,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            "UPDATE followers SET balance = ?, updated_at = ? WHERE leader_id = ? AND address = ?",
        )
        .bind(balance.to_canonical_string())
        .bind(now.as_ms())
        .bind(leader_id.as_i64())
        .bind(address.as_str())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_follower<'e, E>(
        executor: E,
        leader_id: LeaderId,
        address: &Address,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query("DELETE FROM followers WHERE leader_id = ? AND address = ?")
            .bind(leader_id.as_i64())
            .bind(address.as_str())
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_followers<'e, E>(
        executor: E,
        leader_id: LeaderId,
    ) -> Result<Vec<Follower>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let rows = sqlx::query(
            r#"
            SELECT leader_id, address, balance, updated_at
            FROM followers
            WHERE leader_id = ?
            ORDER BY address ASC
            "#,
        )
        .bind(leader_id.as_i64())
        .fetch_all(executor)
        .await?;

        rows.iter().map(follower_from_row).collect()
    }
}
