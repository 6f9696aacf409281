//! Settlement submission from the durable outbox.
//!
//! Each outbox row is submitted and confirmed on its own, under a timeout.
//! A rejected or reverted submission marks that row `failed` and the batch
//! moves on; the sweeper retries it later until the attempt limit is reached.
//! A submission that was accepted but not seen confirmed stays `submitted`
//! with its hash, and the sweeper only polls that hash again.

use crate::db::Repository;
use crate::domain::{LeaderId, SettlementEntry, TimeMs, TxHash};
use crate::ledger::{LedgerClient, LedgerError, SettlementCall};
use alloy_primitives::I256;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },
    #[error("invalid fixed-point amount {0}")]
    InvalidAmount(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Outcome counts for one settlement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub attempted: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Accepted submissions still waiting for a receipt.
    pub unconfirmed: usize,
}

impl SettlementReport {
    pub fn merge(&mut self, other: SettlementReport) {
        self.attempted += other.attempted;
        self.confirmed += other.confirmed;
        self.failed += other.failed;
        self.unconfirmed += other.unconfirmed;
    }
}

enum Submitted {
    Confirmed(TxHash),
    Unconfirmed(TxHash, SettlementError),
}

#[derive(Debug)]
pub struct Settler {
    repo: Arc<Repository>,
    ledger: Arc<dyn LedgerClient>,
    timeout: Duration,
    max_attempts: u32,
    /// Serializes passes so the sweeper and a leader close never submit the
    /// same row concurrently.
    pass_lock: Mutex<()>,
}

impl Settler {
    pub fn new(
        repo: Arc<Repository>,
        ledger: Arc<dyn LedgerClient>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            repo,
            ledger,
            timeout,
            max_attempts,
            pass_lock: Mutex::new(()),
        }
    }

    /// Submit every eligible outbox row for one leader.
    pub async fn settle_leader(&self, leader_id: LeaderId) -> Result<SettlementReport, sqlx::Error> {
        let _pass = self.pass_lock.lock().await;
        let entries = Repository::pending_settlements(
            self.repo.pool(),
            Some(leader_id),
            i64::from(self.max_attempts),
        )
        .await?;
        Ok(self.settle_entries(entries).await)
    }

    /// Poll submitted rows for their receipt, then retry every eligible
    /// outbox row.
    pub async fn sweep(&self) -> Result<SettlementReport, sqlx::Error> {
        let _pass = self.pass_lock.lock().await;
        let mut report = SettlementReport::default();

        let unconfirmed = Repository::unconfirmed_settlements(self.repo.pool(), None).await?;
        for entry in unconfirmed {
            report.merge(self.recheck(&entry).await);
        }

        let entries =
            Repository::pending_settlements(self.repo.pool(), None, i64::from(self.max_attempts))
                .await?;
        if !entries.is_empty() {
            info!(count = entries.len(), "Sweeping pending settlements");
        }
        report.merge(self.settle_entries(entries).await);
        Ok(report)
    }

    /// Wait once more for an accepted transaction. Only a revert makes the
    /// row eligible for resubmission.
    async fn recheck(&self, entry: &SettlementEntry) -> SettlementReport {
        let mut report = SettlementReport::default();
        let Some(tx_hash) = entry.tx_hash.as_ref() else {
            return report;
        };
        match self.confirm(tx_hash).await {
            Ok(()) => {
                report.confirmed += 1;
                info!(
                    leader_id = %entry.leader_id,
                    follower = %entry.follower,
                    position_id = entry.position_id,
                    tx_hash = %tx_hash,
                    "Submitted settlement confirmed"
                );
                if let Err(e) =
                    Repository::mark_settlement_confirmed(self.repo.pool(), entry.id, TimeMs::now()).await
                {
                    error!(outbox_id = entry.id, error = %e, "Failed to record settlement confirmation");
                }
            }
            Err(e @ SettlementError::Ledger(LedgerError::Reverted(_))) => {
                report.failed += 1;
                self.record_failure(entry, entry.attempts, &e).await;
            }
            Err(e) => {
                report.unconfirmed += 1;
                self.record_unconfirmed(entry, tx_hash, &e).await;
            }
        }
        report
    }

    async fn settle_entries(&self, entries: Vec<SettlementEntry>) -> SettlementReport {
        let mut report = SettlementReport::default();
        for entry in entries {
            report.attempted += 1;
            match self.settle_one(&entry).await {
                Ok(Submitted::Confirmed(tx_hash)) => {
                    report.confirmed += 1;
                    info!(
                        leader_id = %entry.leader_id,
                        follower = %entry.follower,
                        position_id = entry.position_id,
                        pnl = %entry.pnl,
                        tx_hash = %tx_hash,
                        "Settlement confirmed"
                    );
                }
                Ok(Submitted::Unconfirmed(tx_hash, e)) => {
                    report.unconfirmed += 1;
                    self.record_unconfirmed(&entry, &tx_hash, &e).await;
                }
                Err(e) => {
                    report.failed += 1;
                    self.record_failure(&entry, entry.attempts + 1, &e).await;
                }
            }
        }
        report
    }

    async fn record_failure(&self, entry: &SettlementEntry, attempts: i64, e: &SettlementError) {
        error!(
            leader_id = %entry.leader_id,
            follower = %entry.follower,
            position_id = entry.position_id,
            attempts,
            error = %e,
            "Settlement failed"
        );
        let now = TimeMs::now();
        if let Err(db_err) =
            Repository::mark_settlement_failed(self.repo.pool(), entry.id, &e.to_string(), now).await
        {
            error!(outbox_id = entry.id, error = %db_err, "Failed to record settlement failure");
        }
    }

    async fn record_unconfirmed(&self, entry: &SettlementEntry, tx_hash: &TxHash, e: &SettlementError) {
        warn!(
            leader_id = %entry.leader_id,
            follower = %entry.follower,
            position_id = entry.position_id,
            tx_hash = %tx_hash,
            error = %e,
            "Settlement submitted but not confirmed"
        );
        let now = TimeMs::now();
        if let Err(db_err) =
            Repository::note_settlement_unconfirmed(self.repo.pool(), entry.id, &e.to_string(), now)
                .await
        {
            error!(outbox_id = entry.id, error = %db_err, "Failed to record unconfirmed settlement");
        }
    }

    async fn confirm(&self, tx_hash: &TxHash) -> Result<(), SettlementError> {
        tokio::time::timeout(self.timeout, self.ledger.confirm_transaction(tx_hash))
            .await
            .map_err(|_| SettlementError::Timeout {
                stage: "confirmation",
                elapsed: self.timeout,
            })??;
        Ok(())
    }

    /// `Err` leaves the row `failed` and retryable.
    async fn settle_one(&self, entry: &SettlementEntry) -> Result<Submitted, SettlementError> {
        let pnl = I256::from_dec_str(&entry.pnl_fixed)
            .map_err(|_| SettlementError::InvalidAmount(entry.pnl_fixed.clone()))?;
        let call = SettlementCall {
            leader_id: entry.leader_id,
            follower: entry.follower.clone(),
            pnl,
        };

        Repository::begin_settlement_attempt(self.repo.pool(), entry.id, TimeMs::now()).await?;

        let tx_hash = tokio::time::timeout(self.timeout, self.ledger.submit_settlement(&call))
            .await
            .map_err(|_| SettlementError::Timeout {
                stage: "submission",
                elapsed: self.timeout,
            })??;
        Repository::mark_settlement_submitted(self.repo.pool(), entry.id, &tx_hash, TimeMs::now())
            .await?;

        match self.confirm(&tx_hash).await {
            Ok(()) => {
                match Repository::mark_settlement_confirmed(self.repo.pool(), entry.id, TimeMs::now())
                    .await
                {
                    Ok(()) => Ok(Submitted::Confirmed(tx_hash)),
                    // Still `submitted`; the next sweep confirms it by hash.
                    Err(e) => Ok(Submitted::Unconfirmed(tx_hash, e.into())),
                }
            }
            Err(e @ SettlementError::Ledger(LedgerError::Reverted(_))) => Err(e),
            Err(e) => Ok(Submitted::Unconfirmed(tx_hash, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_merge() {
        let mut report = SettlementReport {
            attempted: 2,
            confirmed: 1,
            failed: 1,
            unconfirmed: 0,
        };
        report.merge(SettlementReport {
            attempted: 3,
            confirmed: 2,
            failed: 0,
            unconfirmed: 1,
        });
        assert_eq!(
            report,
            SettlementReport {
                attempted: 5,
                confirmed: 3,
                failed: 1,
                unconfirmed: 1,
            }
        );
    }

    #[test]
    fn test_timeout_error_message() {
        let err = SettlementError::Timeout {
            stage: "confirmation",
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "confirmation timed out after 1.5s");
    }
}
