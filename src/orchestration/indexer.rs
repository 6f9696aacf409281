//! Watcher tasks, the settlement sweeper and the on-demand re-scan.

use crate::db::Repository;
use crate::domain::{EventFamily, TimeMs};
use crate::ledger::{subscribe, LedgerClient, LedgerError, RawLog, SubscriptionOptions};
use crate::orchestration::projector::{ProcessOutcome, Projector};
use crate::orchestration::settler::{SettlementReport, Settler};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("a re-scan is already running")]
    Busy,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("ledger {operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct IndexerSettings {
    /// First block watched when a family has no checkpoint yet.
    pub start_block: u64,
    pub subscription: SubscriptionOptions,
    pub sweep_interval: Duration,
    pub read_timeout: Duration,
}

/// Counts for one re-scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RescanReport {
    pub from_block: u64,
    pub to_block: u64,
    pub logs: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub settlements: SettlementReport,
}

impl RescanReport {
    fn record(&mut self, outcome: ProcessOutcome) {
        self.logs += 1;
        match outcome {
            ProcessOutcome::Applied => self.applied += 1,
            ProcessOutcome::Duplicate => self.duplicates += 1,
            ProcessOutcome::DecodeFailed => self.skipped += 1,
            ProcessOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug)]
pub struct Indexer {
    repo: Arc<Repository>,
    ledger: Arc<dyn LedgerClient>,
    projector: Arc<Projector>,
    settler: Arc<Settler>,
    settings: IndexerSettings,
    rescan_lock: Mutex<()>,
}

impl Indexer {
    pub fn new(
        repo: Arc<Repository>,
        ledger: Arc<dyn LedgerClient>,
        projector: Arc<Projector>,
        settler: Arc<Settler>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            repo,
            ledger,
            projector,
            settler,
            settings,
            rescan_lock: Mutex::new(()),
        }
    }

    pub fn settler(&self) -> &Arc<Settler> {
        &self.settler
    }

    /// Project one log and advance the family checkpoint to its block.
    pub async fn process_log(&self, family: EventFamily, raw: &RawLog) -> ProcessOutcome {
        let outcome = self.projector.process(family, raw).await;
        if let Err(e) =
            Repository::save_checkpoint(self.repo.pool(), family, raw.block_number, TimeMs::now())
                .await
        {
            warn!(family = %family, block = raw.block_number, error = %e, "Failed to save checkpoint");
        }
        outcome
    }

    /// Block a watcher resumes from. The checkpoint block itself is replayed
    /// since a crash may have interrupted it part way; the guard absorbs the
    /// repeats.
    pub async fn resume_block(&self, family: EventFamily) -> Result<u64, sqlx::Error> {
        let checkpoint = Repository::get_checkpoint(self.repo.pool(), family).await?;
        Ok(checkpoint
            .map(|block| block.max(self.settings.start_block))
            .unwrap_or(self.settings.start_block))
    }

    /// Start one watcher per event family. Each consumes its stream in order
    /// and runs until aborted.
    pub fn spawn_watchers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        EventFamily::ALL
            .iter()
            .map(|&family| {
                let indexer = Arc::clone(self);
                tokio::spawn(async move { indexer.watch(family).await })
            })
            .collect()
    }

    async fn watch(&self, family: EventFamily) {
        let from_block = loop {
            match self.resume_block(family).await {
                Ok(block) => break block,
                Err(e) => {
                    error!(family = %family, error = %e, "Cannot read checkpoint, retrying");
                    tokio::time::sleep(self.settings.subscription.poll_interval).await;
                }
            }
        };
        info!(family = %family, from_block = from_block, "Watcher started");

        let mut stream = subscribe(
            self.ledger.clone(),
            family,
            from_block,
            self.settings.subscription,
        );
        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => {
                    self.process_log(family, &raw).await;
                }
                Err(e) => warn!(family = %family, error = %e, "Log poll failed"),
            }
        }
        warn!(family = %family, "Watcher stream ended");
    }

    /// Periodically re-poll submitted settlements and retry those left
    /// pending or failed.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(indexer.settings.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match indexer.settler.sweep().await {
                    Ok(report) if report != SettlementReport::default() => info!(
                        attempted = report.attempted,
                        confirmed = report.confirmed,
                        failed = report.failed,
                        unconfirmed = report.unconfirmed,
                        "Sweeper pass finished"
                    ),
                    Ok(_) => debug!("Sweeper found nothing to settle"),
                    Err(e) => error!(error = %e, "Sweeper pass failed"),
                }
            }
        })
    }

    /// Replay every family from `from_block` (default: the configured start
    /// block) up to the current head, then run one sweeper pass.
    ///
    /// Logs from all families are merged and applied in chain order within
    /// each block range. Returns `Busy` rather than queueing behind a running
    /// re-scan.
    pub async fn rescan(&self, from_block: Option<u64>) -> Result<RescanReport, IndexerError> {
        let _guard = self.rescan_lock.try_lock().map_err(|_| IndexerError::Busy)?;

        let from_block = from_block.unwrap_or(self.settings.start_block);
        let latest = self
            .with_read_timeout("latest_block", self.ledger.latest_block())
            .await?;

        let mut report = RescanReport {
            from_block,
            to_block: latest,
            ..RescanReport::default()
        };
        info!(from_block = from_block, to_block = latest, "Re-scan started");

        let span = self.settings.subscription.max_block_range.max(1);
        let mut start = from_block;
        while start <= latest {
            let end = start.saturating_add(span - 1).min(latest);

            let mut batch = Vec::new();
            for family in EventFamily::ALL {
                let logs = self
                    .with_read_timeout("fetch_logs", self.ledger.fetch_logs(family, start, end))
                    .await?;
                batch.extend(logs.into_iter().map(|log| (family, log)));
            }
            batch.sort_by_key(|(_, log)| (log.block_number, log.log_index));

            for (family, raw) in &batch {
                report.record(self.process_log(*family, raw).await);
            }

            match end.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }

        report.settlements = self.settler.sweep().await?;
        info!(
            logs = report.logs,
            applied = report.applied,
            duplicates = report.duplicates,
            failed = report.failed,
            "Re-scan finished"
        );
        Ok(report)
    }

    async fn with_read_timeout<T, F>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> Result<T, IndexerError>
    where
        F: std::future::Future<Output = Result<T, LedgerError>>,
    {
        let elapsed = self.settings.read_timeout;
        tokio::time::timeout(elapsed, fut)
            .await
            .map_err(|_| IndexerError::Timeout { operation, elapsed })?
            .map_err(IndexerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use crate::domain::{Address, LeaderId, LedgerEvent};
    use crate::ledger::MockLedgerClient;
    use alloy_primitives::U256;
    use std::str::FromStr;

    fn settings() -> IndexerSettings {
        IndexerSettings {
            start_block: 0,
            subscription: SubscriptionOptions {
                poll_interval: Duration::from_millis(10),
                max_block_range: 2,
            },
            sweep_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(5),
        }
    }

    fn build(
        repo: Arc<Repository>,
        ledger: Arc<dyn LedgerClient>,
        settings: IndexerSettings,
    ) -> Indexer {
        let settler = Arc::new(Settler::new(
            repo.clone(),
            ledger.clone(),
            Duration::from_secs(5),
            3,
        ));
        let projector = Arc::new(Projector::new(
            repo.clone(),
            ledger.clone(),
            settler.clone(),
            0,
            settings.read_timeout,
        ));
        Indexer::new(repo, ledger, projector, settler, settings)
    }

    fn subscribed(block: u64, amount: u64) -> RawLog {
        RawLog::from_event(
            &LedgerEvent::Subscribed {
                leader_id: LeaderId::new(1),
                follower: Address::from_str("0x00000000000000000000000000000000000000f1")
                    .unwrap(),
                amount: U256::from(amount),
            },
            &format!("0x{:02x}", block),
            block,
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resume_block_prefers_checkpoint() {
        let (repo, _temp) = setup_test_db().await;
        let repo = Arc::new(repo);
        let indexer = build(
            repo.clone(),
            Arc::new(MockLedgerClient::new()),
            IndexerSettings {
                start_block: 5,
                ..settings()
            },
        );

        assert_eq!(indexer.resume_block(EventFamily::Subscribed).await.unwrap(), 5);
        Repository::save_checkpoint(repo.pool(), EventFamily::Subscribed, 42, TimeMs::new(1))
            .await
            .unwrap();
        assert_eq!(indexer.resume_block(EventFamily::Subscribed).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_rescan_spans_ranges_and_is_idempotent() {
        let (repo, _temp) = setup_test_db().await;
        let repo = Arc::new(repo);
        let ledger = MockLedgerClient::new()
            .with_log(EventFamily::Subscribed, subscribed(1, 100))
            .with_log(EventFamily::Subscribed, subscribed(4, 50));
        let indexer = build(repo.clone(), Arc::new(ledger), settings());

        let first = indexer.rescan(None).await.unwrap();
        assert_eq!(first.to_block, 4);
        assert_eq!(first.logs, 2);
        assert_eq!(first.applied, 2);

        let second = indexer.rescan(Some(0)).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 2);

        let leader = Repository::get_leader(repo.pool(), LeaderId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leader.follower_count, 1);
        assert_eq!(leader.total_deposits.to_string(), "150");
        assert_eq!(
            Repository::get_checkpoint(repo.pool(), EventFamily::Subscribed)
                .await
                .unwrap(),
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_concurrent_rescan_is_busy() {
        let (repo, _temp) = setup_test_db().await;
        let indexer = build(Arc::new(repo), Arc::new(MockLedgerClient::new()), settings());

        let _held = indexer.rescan_lock.lock().await;
        assert!(matches!(indexer.rescan(None).await, Err(IndexerError::Busy)));
    }
}
