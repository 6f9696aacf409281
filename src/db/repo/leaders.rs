//! Leader registration and aggregate operations.

use crate::domain::{Address, Decimal, Leader, LeaderId, TimeMs};
use sqlx::sqlite::{SqliteConnection, SqliteExecutor, SqliteRow};
use sqlx::Row;

use super::{decimal_column, Repository};

fn leader_from_row(row: &SqliteRow) -> Result<Leader, sqlx::Error> {
    Ok(Leader {
        id: LeaderId::from_i64(row.try_get("id")?),
        address: row
            .try_get::<Option<String>, _>("address")?
            .map(Address::new),
        description: row.try_get("description")?,
        fee_bps: row.try_get::<i64, _>("fee_bps")? as u16,
        follower_count: row.try_get("follower_count")?,
        total_deposits: decimal_column(&row.try_get::<String, _>("total_deposits")?, "total_deposits")?,
        accrued_fees: decimal_column(&row.try_get::<String, _>("accrued_fees")?, "accrued_fees")?,
        updated_at: TimeMs::new(row.try_get("updated_at")?),
    })
}

impl Repository {
    /// Record a registration. A placeholder row keeps its totals; only the
    /// identity fields are filled in.
    pub async fn upsert_leader_registration<'e, E>(
        executor: E,
        id: LeaderId,
        address: &Address,
        description: &str,
        fee_bps: u16,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO leaders (id, address, description, fee_bps, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                description = excluded.description,
                fee_bps = excluded.fee_bps,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id.as_i64())
        .bind(address.as_str())
        .bind(description)
        .bind(i64::from(fee_bps))
        .bind(now.as_ms())
        .bind(now.as_ms())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Create a placeholder leader (no address, zero totals) if the id is unseen.
    ///
    /// Returns true when a row was created.
    pub async fn ensure_leader<'e, E>(
        executor: E,
        id: LeaderId,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO leaders (id, created_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id.as_i64())
        .bind(now.as_ms())
        .bind(now.as_ms())
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_leader<'e, E>(executor: E, id: LeaderId) -> Result<Option<Leader>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, address, description, fee_bps, follower_count,
                   total_deposits, accrued_fees, updated_at
            FROM leaders
            WHERE id = ?
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(executor)
        .await?;

        row.as_ref().map(leader_from_row).transpose()
    }

    /// Apply deltas to total deposits and follower count, creating a
    /// placeholder leader first if needed.
    pub async fn adjust_leader_totals(
        conn: &mut SqliteConnection,
        id: LeaderId,
        deposit_delta: Decimal,
        follower_delta: i64,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        Self::ensure_leader(&mut *conn, id, now).await?;
        let current: String = sqlx::query_scalar("SELECT total_deposits FROM leaders WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(&mut *conn)
            .await?;
        let total = decimal_column(&current, "total_deposits")? + deposit_delta;

        sqlx::query(
            r#"
            UPDATE leaders
            SET total_deposits = ?, follower_count = follower_count + ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(total.to_canonical_string())
        .bind(follower_delta)
        .bind(now.as_ms())
        .bind(id.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Apply a signed delta to accrued fees.
    pub async fn adjust_leader_fees(
        conn: &mut SqliteConnection,
        id: LeaderId,
        delta: Decimal,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        Self::ensure_leader(&mut *conn, id, now).await?;
        let current: String = sqlx::query_scalar("SELECT accrued_fees FROM leaders WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(&mut *conn)
            .await?;
        let fees = decimal_column(&current, "accrued_fees")? + delta;

        sqlx::query("UPDATE leaders SET accrued_fees = ?, updated_at = ? WHERE id = ?")
            .bind(fees.to_canonical_string())
            .bind(now.as_ms())
            .bind(id.as_i64())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[tokio::test]
    async fn test_registration_after_placeholder_keeps_totals() {
        let (repo, _temp) = setup_test_db().await;
        let id = LeaderId::new(7);
        let mut conn = repo.pool().acquire().await.unwrap();

        Repository::adjust_leader_totals(&mut conn, id, d("150"), 1, TimeMs::new(1))
            .await
            .unwrap();
        let placeholder = Repository::get_leader(repo.pool(), id).await.unwrap().unwrap();
        assert_eq!(placeholder.address, None);
        assert_eq!(placeholder.total_deposits, d("150"));

        let address = Address::from_str("0x00000000000000000000000000000000000000a1").unwrap();
        Repository::upsert_leader_registration(repo.pool(), id, &address, "momentum", 250, TimeMs::new(2))
            .await
            .unwrap();

        let leader = Repository::get_leader(repo.pool(), id).await.unwrap().unwrap();
        assert_eq!(leader.address, Some(address));
        assert_eq!(leader.description, "momentum");
        assert_eq!(leader.fee_bps, 250);
        assert_eq!(leader.follower_count, 1);
        assert_eq!(leader.total_deposits, d("150"));
    }

    #[tokio::test]
    async fn test_fee_adjustments_are_signed() {
        let (repo, _temp) = setup_test_db().await;
        let id = LeaderId::new(1);
        let mut conn = repo.pool().acquire().await.unwrap();

        Repository::adjust_leader_fees(&mut conn, id, d("10.5"), TimeMs::new(1))
            .await
            .unwrap();
        Repository::adjust_leader_fees(&mut conn, id, -d("4"), TimeMs::new(2))
            .await
            .unwrap();

        let leader = Repository::get_leader(repo.pool(), id).await.unwrap().unwrap();
        assert_eq!(leader.accrued_fees, d("6.5"));
    }

    #[tokio::test]
    async fn test_ensure_leader_reports_creation() {
        let (repo, _temp) = setup_test_db().await;
        assert!(Repository::ensure_leader(repo.pool(), LeaderId::new(3), TimeMs::new(1))
            .await
            .unwrap());
        assert!(!Repository::ensure_leader(repo.pool(), LeaderId::new(3), TimeMs::new(2))
            .await
            .unwrap());
        assert!(Repository::get_leader(repo.pool(), LeaderId::new(4))
            .await
            .unwrap()
            .is_none());
    }
}
