//! Per-family watcher checkpoints.

use crate::domain::{EventFamily, TimeMs};
use sqlx::sqlite::SqliteExecutor;

use super::Repository;

impl Repository {
    /// Last block fully processed for the family, if any.
    pub async fn get_checkpoint<'e, E>(
        executor: E,
        family: EventFamily,
    ) -> Result<Option<u64>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT last_block FROM watcher_checkpoints WHERE family = ?")
                .bind(family.name())
                .fetch_optional(executor)
                .await?;
        Ok(block.map(|b| b as u64))
    }

    /// Advance the checkpoint. It never moves backwards, so a re-scan from an
    /// earlier block leaves live progress intact.
    pub async fn save_checkpoint<'e, E>(
        executor: E,
        family: EventFamily,
        block: u64,
        now: TimeMs,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO watcher_checkpoints (family, last_block, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(family) DO UPDATE SET
                last_block = MAX(last_block, excluded.last_block),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(family.name())
        .bind(block as i64)
        .bind(now.as_ms())
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;

    #[tokio::test]
    async fn test_checkpoint_only_moves_forward() {
        let (repo, _temp) = setup_test_db().await;
        let family = EventFamily::Subscribed;

        assert_eq!(Repository::get_checkpoint(repo.pool(), family).await.unwrap(), None);

        Repository::save_checkpoint(repo.pool(), family, 120, TimeMs::new(1))
            .await
            .unwrap();
        Repository::save_checkpoint(repo.pool(), family, 80, TimeMs::new(2))
            .await
            .unwrap();
        assert_eq!(
            Repository::get_checkpoint(repo.pool(), family).await.unwrap(),
            Some(120)
        );
        assert_eq!(
            Repository::get_checkpoint(repo.pool(), EventFamily::LeaderSignal)
                .await
                .unwrap(),
            None
        );
    }
}
