//! Projected store records: leaders, followers, positions and the settlement outbox.

use crate::domain::{Address, Decimal, Direction, LeaderId, TimeMs, TxHash};
use serde::{Deserialize, Serialize};

/// A registered leader with its denormalized aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    pub id: LeaderId,
    /// None until the registration event has been observed.
    pub address: Option<Address>,
    pub description: String,
    pub fee_bps: u16,
    pub follower_count: i64,
    pub total_deposits: Decimal,
    pub accrued_fees: Decimal,
    pub updated_at: TimeMs,
}

/// A follower relationship, scoped to one leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follower {
    pub leader_id: LeaderId,
    pub address: Address,
    pub balance: Decimal,
    pub updated_at: TimeMs,
}

/// A leader-owned (`follower == None`) or follower-owned position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Store-assigned, monotonic. Also the tie-breaker for "most recent".
    pub id: i64,
    pub leader_id: LeaderId,
    pub follower: Option<Address>,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub size_usd: Decimal,
    pub is_open: bool,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub index_token: Address,
    pub tx_hash: TxHash,
    pub opened_at: TimeMs,
    pub closed_at: Option<TimeMs>,
}

/// Fields needed to open a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPosition {
    pub leader_id: LeaderId,
    pub follower: Option<Address>,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub size_usd: Decimal,
    pub index_token: Address,
    pub tx_hash: TxHash,
    pub opened_at: TimeMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    /// Persisted, not yet sent.
    Pending,
    /// Accepted by the node, receipt not yet seen.
    Submitted,
    Confirmed,
    /// Last attempt failed; eligible for the sweeper.
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Submitted => "submitted",
            SettlementStatus::Confirmed => "confirmed",
            SettlementStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SettlementStatus::Pending),
            "submitted" => Some(SettlementStatus::Submitted),
            "confirmed" => Some(SettlementStatus::Confirmed),
            "failed" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

/// Settlement computed for one follower position at leader close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSettlement {
    pub position_id: i64,
    pub leader_id: LeaderId,
    pub follower: Address,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    /// Signed fixed-point amount sent on-chain, as a decimal integer string.
    pub pnl_fixed: String,
}

/// A row of the durable settlement outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEntry {
    pub id: i64,
    pub position_id: i64,
    pub leader_id: LeaderId,
    pub follower: Address,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_fixed: String,
    pub status: SettlementStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub tx_hash: Option<TxHash>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_status_roundtrip() {
        for status in [
            SettlementStatus::Pending,
            SettlementStatus::Submitted,
            SettlementStatus::Confirmed,
            SettlementStatus::Failed,
        ] {
            assert_eq!(SettlementStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SettlementStatus::parse("unknown"), None);
    }
}
