//! State projection: applies decoded ledger events to the store.
//!
//! Per raw log: decode, consult the guard, then apply inside one SQLite
//! transaction whose first statement is the event-log claim. Work that must
//! not hold the write lock (deposit reconciliation reads, settlement
//! submission) runs after commit.

use crate::db::{EventRecord, Repository};
use crate::domain::{
    Address, AmountError, Decimal, DecodedLog, Direction, EventFamily, LeaderId, LedgerEvent,
    NewPosition, NewSettlement, SignalAction, TimeMs,
};
use crate::engine::{allocate_mirror_sizes, compute_pnl, quote_settlement, AllocationError};
use crate::ledger::{decode_log, LedgerClient, RawLog};
use crate::orchestration::guard::IdempotencyGuard;
use crate::orchestration::settler::Settler;
use alloy_primitives::{I256, U256};
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// What happened to one delivered log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied,
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Not decodable; skipped without an event log row.
    DecodeFailed,
    /// Projection failed and was rolled back; a `failed` row was recorded.
    Failed,
}

/// Post-commit work produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FollowUp {
    None,
    Reconcile { leader_id: LeaderId, follower: Address },
    Settle { leader_id: LeaderId },
}

#[derive(Debug)]
pub struct Projector {
    repo: Arc<Repository>,
    ledger: Arc<dyn LedgerClient>,
    guard: IdempotencyGuard,
    settler: Arc<Settler>,
    decimals: u32,
    read_timeout: Duration,
}

impl Projector {
    pub fn new(
        repo: Arc<Repository>,
        ledger: Arc<dyn LedgerClient>,
        settler: Arc<Settler>,
        decimals: u32,
        read_timeout: Duration,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(repo.clone()),
            repo,
            ledger,
            settler,
            decimals,
            read_timeout,
        }
    }

    /// Process one raw log of the given family. Never returns an error:
    /// every failure is logged and confined to this entry.
    pub async fn process(&self, family: EventFamily, raw: &RawLog) -> ProcessOutcome {
        let decoded = match decode_log(family, raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    family = %family,
                    tx_hash = %raw.tx_hash,
                    block = raw.block_number,
                    log_index = raw.log_index,
                    error = %e,
                    "Skipping undecodable log"
                );
                return ProcessOutcome::DecodeFailed;
            }
        };

        let key = decoded.idempotency_key();
        match self.guard.already_processed(family, &key).await {
            Ok(true) => {
                debug!(family = %family, key = %key, "Skipping already processed event");
                return ProcessOutcome::Duplicate;
            }
            Ok(false) => {}
            // The in-transaction claim still protects against double application.
            Err(e) => warn!(family = %family, key = %key, error = %e, "Guard lookup failed"),
        }

        let record = EventRecord::from_decoded(&decoded);
        match self.apply(&decoded, &record).await {
            Ok(Some(follow_up)) => {
                self.run_follow_up(follow_up).await;
                ProcessOutcome::Applied
            }
            Ok(None) => {
                debug!(family = %family, key = %key, "Event claimed concurrently, skipping");
                ProcessOutcome::Duplicate
            }
            Err(e) => {
                error!(
                    family = %family,
                    key = %key,
                    leader_id = %decoded.event.leader_id(),
                    error = %e,
                    "Projection failed"
                );
                if let Err(db_err) = Repository::record_failed_event(
                    self.repo.pool(),
                    &record,
                    &e.to_string(),
                    TimeMs::now(),
                )
                .await
                {
                    warn!(key = %key, error = %db_err, "Could not record failed event");
                }
                ProcessOutcome::Failed
            }
        }
    }

    /// Returns `None` when the claim was lost to a concurrent writer.
    async fn apply(
        &self,
        decoded: &DecodedLog,
        record: &EventRecord,
    ) -> Result<Option<FollowUp>, ProjectionError> {
        let now = TimeMs::now();
        let mut tx = self.repo.begin().await?;

        if !IdempotencyGuard::claim(&mut tx, record, now).await? {
            tx.rollback().await?;
            return Ok(None);
        }

        match self.project(&mut tx, decoded, now).await {
            Ok(follow_up) => {
                tx.commit().await?;
                Ok(Some(follow_up))
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn project(
        &self,
        conn: &mut SqliteConnection,
        decoded: &DecodedLog,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        let follow_up = match &decoded.event {
            LedgerEvent::LeaderRegistered {
                leader_id,
                leader,
                meta,
                fee_bps,
            } => {
                Repository::upsert_leader_registration(
                    &mut *conn, *leader_id, leader, meta, *fee_bps, now,
                )
                .await?;
                info!(leader_id = %leader_id, leader = %leader, fee_bps = fee_bps, "Leader registered");
                FollowUp::None
            }
            LedgerEvent::Subscribed {
                leader_id,
                follower,
                amount,
            } => {
                self.on_subscribed(&mut *conn, *leader_id, follower, *amount, now)
                    .await?
            }
            LedgerEvent::Unsubscribed {
                leader_id,
                follower,
                amount,
            } => {
                self.on_unsubscribed(&mut *conn, *leader_id, follower, *amount, now)
                    .await?
            }
            LedgerEvent::FollowerMirrored {
                leader_id,
                follower,
                action,
                size_usd,
                is_long,
                entry_price,
                index_token,
            } => {
                let mirror = MirrorFields {
                    action: *action,
                    size_usd: *size_usd,
                    is_long: *is_long,
                    entry_price: *entry_price,
                    index_token,
                };
                self.on_mirrored(&mut *conn, decoded, *leader_id, follower, mirror, now)
                    .await?
            }
            LedgerEvent::FollowerPnLSettled {
                leader_id,
                follower,
                pnl_usd,
            } => {
                self.on_pnl_settled(&mut *conn, *leader_id, follower, *pnl_usd, now)
                    .await?
            }
            LedgerEvent::LeaderFeesAccrued { leader_id, amount } => {
                let amount = Decimal::from_fixed_point(*amount, self.decimals)?;
                Repository::adjust_leader_fees(&mut *conn, *leader_id, amount, now).await?;
                FollowUp::None
            }
            LedgerEvent::LeaderWithdraw {
                leader_id,
                to,
                amount,
            } => {
                let amount = Decimal::from_fixed_point(*amount, self.decimals)?;
                Repository::adjust_leader_fees(&mut *conn, *leader_id, -amount, now).await?;
                debug!(leader_id = %leader_id, to = %to, amount = %amount, "Leader withdrew fees");
                FollowUp::None
            }
            LedgerEvent::LeaderSignal {
                leader_id,
                action,
                size_usd,
                index_token,
                entry_price,
                ..
            } => match action {
                SignalAction::OpenLong | SignalAction::OpenShort => {
                    let direction = Direction::from_is_long(*action == SignalAction::OpenLong);
                    self.on_leader_open(
                        &mut *conn,
                        decoded,
                        *leader_id,
                        direction,
                        *size_usd,
                        *entry_price,
                        index_token,
                        now,
                    )
                    .await?
                }
                SignalAction::Close => {
                    self.on_leader_close(&mut *conn, *leader_id, *entry_price, now)
                        .await?
                }
            },
        };

        Ok(follow_up)
    }

    async fn on_subscribed(
        &self,
        conn: &mut SqliteConnection,
        leader_id: LeaderId,
        follower: &Address,
        amount: U256,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        let amount = Decimal::from_fixed_point(amount, self.decimals)?;
        Repository::ensure_leader(&mut *conn, leader_id, now).await?;

        match Repository::get_follower(&mut *conn, leader_id, follower).await? {
            Some(existing) => {
                Repository::set_follower_balance(
                    &mut *conn,
                    leader_id,
                    follower,
                    existing.balance + amount,
                    now,
                )
                .await?;
                Repository::adjust_leader_totals(conn, leader_id, amount, 0, now).await?;
            }
            None => {
                Repository::insert_follower(&mut *conn, leader_id, follower, amount, now).await?;
                Repository::adjust_leader_totals(conn, leader_id, amount, 1, now).await?;
            }
        }
        info!(leader_id = %leader_id, follower = %follower, amount = %amount, "Follower subscribed");
        Ok(FollowUp::None)
    }

    async fn on_unsubscribed(
        &self,
        conn: &mut SqliteConnection,
        leader_id: LeaderId,
        follower: &Address,
        amount: U256,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        let amount = Decimal::from_fixed_point(amount, self.decimals)?;

        let Some(existing) = Repository::get_follower(&mut *conn, leader_id, follower).await?
        else {
            warn!(
                leader_id = %leader_id,
                follower = %follower,
                "Unsubscribe for unknown follower, aggregates unchanged"
            );
            return Ok(FollowUp::None);
        };

        if amount != existing.balance {
            warn!(
                leader_id = %leader_id,
                follower = %follower,
                amount = %amount,
                stored_balance = %existing.balance,
                "Unsubscribe amount differs from stored balance, removing the stored balance"
            );
        }
        Repository::delete_follower(&mut *conn, leader_id, follower).await?;
        Repository::adjust_leader_totals(conn, leader_id, -existing.balance, -1, now).await?;
        info!(leader_id = %leader_id, follower = %follower, amount = %amount, "Follower unsubscribed");
        Ok(FollowUp::None)
    }

    async fn on_mirrored(
        &self,
        conn: &mut SqliteConnection,
        decoded: &DecodedLog,
        leader_id: LeaderId,
        follower: &Address,
        mirror: MirrorFields<'_>,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        Repository::ensure_leader(&mut *conn, leader_id, now).await?;
        if Repository::get_follower(&mut *conn, leader_id, follower)
            .await?
            .is_none()
        {
            // Mirror arrived before the subscribe: track the follower now,
            // the subscribe will add its balance.
            Repository::insert_follower(&mut *conn, leader_id, follower, Decimal::zero(), now)
                .await?;
            Repository::adjust_leader_totals(&mut *conn, leader_id, Decimal::zero(), 1, now)
                .await?;
        }

        if mirror.action == SignalAction::Close {
            debug!(leader_id = %leader_id, follower = %follower, "Mirror close recorded, no position change");
            return Ok(FollowUp::None);
        }

        let entry_price = Decimal::from_fixed_point(mirror.entry_price, self.decimals)?;
        let size_usd = Decimal::from_fixed_point(mirror.size_usd, self.decimals)?;

        if let Some(stale) =
            Repository::find_open_follower_position(&mut *conn, leader_id, follower).await?
        {
            warn!(
                leader_id = %leader_id,
                follower = %follower,
                position_id = stale.id,
                "Follower already has an open position, closing it at the new entry price"
            );
            Repository::close_position(&mut *conn, stale.id, entry_price, None, now).await?;
        }

        let position_id = Repository::insert_position(
            &mut *conn,
            &NewPosition {
                leader_id,
                follower: Some(follower.clone()),
                direction: Direction::from_is_long(mirror.is_long),
                entry_price,
                size_usd,
                index_token: mirror.index_token.clone(),
                tx_hash: decoded.meta.tx_hash.clone(),
                opened_at: now,
            },
        )
        .await?;
        info!(
            leader_id = %leader_id,
            follower = %follower,
            position_id = position_id,
            size_usd = %size_usd,
            entry_price = %entry_price,
            "Follower position opened"
        );
        Ok(FollowUp::None)
    }

    async fn on_pnl_settled(
        &self,
        conn: &mut SqliteConnection,
        leader_id: LeaderId,
        follower: &Address,
        pnl_usd: I256,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        let pnl = Decimal::from_fixed_point_signed(pnl_usd, self.decimals)?;

        match Repository::find_open_follower_position(&mut *conn, leader_id, follower).await? {
            Some(position) => {
                let outbox =
                    Repository::get_settlement_for_position(&mut *conn, position.id).await?;
                let exit_price = outbox
                    .as_ref()
                    .map(|entry| entry.exit_price)
                    .unwrap_or(position.entry_price);

                Repository::close_position(&mut *conn, position.id, exit_price, Some(pnl), now)
                    .await?;
                if let Some(entry) = outbox {
                    Repository::mark_settlement_confirmed(&mut *conn, entry.id, now).await?;
                }
                info!(
                    leader_id = %leader_id,
                    follower = %follower,
                    position_id = position.id,
                    pnl = %pnl,
                    "Follower position settled"
                );
            }
            None => warn!(
                leader_id = %leader_id,
                follower = %follower,
                pnl = %pnl,
                "Settlement event without an open follower position"
            ),
        }

        Ok(FollowUp::Reconcile {
            leader_id,
            follower: follower.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_leader_open(
        &self,
        conn: &mut SqliteConnection,
        decoded: &DecodedLog,
        leader_id: LeaderId,
        direction: Direction,
        size_usd: U256,
        entry_price: U256,
        index_token: &Address,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        let entry = Decimal::from_fixed_point(entry_price, self.decimals)?;
        let size = Decimal::from_fixed_point(size_usd, self.decimals)?;
        Repository::ensure_leader(&mut *conn, leader_id, now).await?;

        if let Some(stale) = Repository::find_open_leader_position(&mut *conn, leader_id).await? {
            warn!(
                leader_id = %leader_id,
                position_id = stale.id,
                "Leader already has an open position, closing it at the new entry price"
            );
            let pnl = compute_pnl(stale.direction, stale.entry_price, entry, stale.size_usd)?;
            Repository::close_position(&mut *conn, stale.id, entry, Some(pnl), now).await?;
        }

        let position_id = Repository::insert_position(
            &mut *conn,
            &NewPosition {
                leader_id,
                follower: None,
                direction,
                entry_price: entry,
                size_usd: size,
                index_token: index_token.clone(),
                tx_hash: decoded.meta.tx_hash.clone(),
                opened_at: now,
            },
        )
        .await?;
        info!(
            leader_id = %leader_id,
            position_id = position_id,
            direction = %direction,
            size_usd = %size,
            entry_price = %entry,
            "Leader position opened"
        );

        self.log_expected_allocation(conn, leader_id, size_usd).await?;
        Ok(FollowUp::None)
    }

    /// Diagnostic only: the ledger emits the authoritative per-follower mirrors.
    async fn log_expected_allocation(
        &self,
        conn: &mut SqliteConnection,
        leader_id: LeaderId,
        size_usd: U256,
    ) -> Result<(), ProjectionError> {
        let followers = Repository::list_followers(&mut *conn, leader_id).await?;
        let balances = followers
            .into_iter()
            .map(|f| {
                f.balance
                    .to_fixed_point_unsigned(self.decimals)
                    .map(|b| (f.address, b))
            })
            .collect::<Result<Vec<_>, AmountError>>()?;

        match allocate_mirror_sizes(size_usd, &balances) {
            Ok(allocations) => {
                for allocation in allocations {
                    debug!(
                        leader_id = %leader_id,
                        follower = %allocation.follower,
                        expected_size = %allocation.size,
                        "Expected mirror size"
                    );
                }
            }
            Err(AllocationError::TotalOverflow) | Err(AllocationError::ProductOverflow(_)) => {
                warn!(leader_id = %leader_id, "Expected mirror sizes overflow U256");
            }
        }
        Ok(())
    }

    async fn on_leader_close(
        &self,
        conn: &mut SqliteConnection,
        leader_id: LeaderId,
        exit_price: U256,
        now: TimeMs,
    ) -> Result<FollowUp, ProjectionError> {
        let exit = Decimal::from_fixed_point(exit_price, self.decimals)?;
        Repository::ensure_leader(&mut *conn, leader_id, now).await?;

        match Repository::find_open_leader_position(&mut *conn, leader_id).await? {
            Some(position) => {
                let pnl =
                    compute_pnl(position.direction, position.entry_price, exit, position.size_usd)?;
                Repository::close_position(&mut *conn, position.id, exit, Some(pnl), now).await?;
                info!(
                    leader_id = %leader_id,
                    position_id = position.id,
                    exit_price = %exit,
                    pnl = %pnl,
                    "Leader position closed"
                );
            }
            None => warn!(leader_id = %leader_id, "Leader close without an open position"),
        }

        let open = Repository::list_open_follower_positions(&mut *conn, leader_id).await?;
        let mut queued = 0usize;
        for position in &open {
            let Some(follower) = position.follower.clone() else {
                continue;
            };
            let quote = match quote_settlement(position, exit, self.decimals) {
                Ok(quote) => quote,
                Err(e) => {
                    error!(
                        leader_id = %leader_id,
                        follower = %follower,
                        position_id = position.id,
                        error = %e,
                        "Cannot compute settlement"
                    );
                    continue;
                }
            };
            let settlement = NewSettlement {
                position_id: position.id,
                leader_id,
                follower,
                exit_price: exit,
                pnl: quote.pnl,
                pnl_fixed: quote.pnl_fixed,
            };
            if Repository::enqueue_settlement(&mut *conn, &settlement, now).await? {
                queued += 1;
            }
        }
        info!(leader_id = %leader_id, queued = queued, "Settlements queued");

        Ok(FollowUp::Settle { leader_id })
    }

    async fn run_follow_up(&self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::None => {}
            FollowUp::Reconcile {
                leader_id,
                follower,
            } => self.reconcile_balance(leader_id, &follower).await,
            FollowUp::Settle { leader_id } => match self.settler.settle_leader(leader_id).await {
                Ok(report) => info!(
                    leader_id = %leader_id,
                    attempted = report.attempted,
                    confirmed = report.confirmed,
                    failed = report.failed,
                    unconfirmed = report.unconfirmed,
                    "Leader settlement pass finished"
                ),
                Err(e) => error!(leader_id = %leader_id, error = %e, "Leader settlement pass failed"),
            },
        }
    }

    /// Overwrite the follower balance with the on-chain deposit. On a failed
    /// or slow read the stored value is kept.
    async fn reconcile_balance(&self, leader_id: LeaderId, follower: &Address) {
        let read = tokio::time::timeout(
            self.read_timeout,
            self.ledger.read_deposit(leader_id, follower),
        )
        .await;
        let raw = match read {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(leader_id = %leader_id, follower = %follower, error = %e, "Deposit read failed, keeping stored balance");
                return;
            }
            Err(_) => {
                warn!(
                    leader_id = %leader_id,
                    follower = %follower,
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "Deposit read timed out, keeping stored balance"
                );
                return;
            }
        };

        if let Err(e) = self.store_balance(leader_id, follower, raw).await {
            error!(leader_id = %leader_id, follower = %follower, error = %e, "Failed to store reconciled balance");
        }
    }

    async fn store_balance(
        &self,
        leader_id: LeaderId,
        follower: &Address,
        raw: U256,
    ) -> Result<(), ProjectionError> {
        let balance = Decimal::from_fixed_point(raw, self.decimals)?;
        let now = TimeMs::now();
        let mut tx = self.repo.begin().await?;

        let Some(existing) = Repository::get_follower(&mut *tx, leader_id, follower).await? else {
            debug!(leader_id = %leader_id, follower = %follower, "No follower row to reconcile");
            return Ok(());
        };
        let delta = balance - existing.balance;
        Repository::set_follower_balance(&mut *tx, leader_id, follower, balance, now).await?;
        if !delta.is_zero() {
            Repository::adjust_leader_totals(&mut tx, leader_id, delta, 0, now).await?;
        }
        tx.commit().await?;

        debug!(leader_id = %leader_id, follower = %follower, balance = %balance, delta = %delta, "Balance reconciled");
        Ok(())
    }
}

/// Mirror event fields that shape the follower position.
#[derive(Debug, Clone, Copy)]
struct MirrorFields<'a> {
    action: SignalAction,
    size_usd: U256,
    is_long: bool,
    entry_price: U256,
    index_token: &'a Address,
}
