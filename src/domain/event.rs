//! Typed ledger events.
//!
//! Every raw log is decoded exactly once at the ledger boundary into a
//! [`LedgerEvent`]; downstream code matches on the variant.

use crate::domain::{Address, LeaderId, TxHash};
use alloy_primitives::{I256, U256};
use serde::{Deserialize, Serialize};

/// Logical event family. One subscription is kept per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFamily {
    LeaderRegistered,
    Subscribed,
    Unsubscribed,
    FollowerMirrored,
    FollowerPnLSettled,
    LeaderFeesAccrued,
    LeaderWithdraw,
    LeaderSignal,
}

impl EventFamily {
    pub const ALL: [EventFamily; 8] = [
        EventFamily::LeaderRegistered,
        EventFamily::Subscribed,
        EventFamily::Unsubscribed,
        EventFamily::FollowerMirrored,
        EventFamily::FollowerPnLSettled,
        EventFamily::LeaderFeesAccrued,
        EventFamily::LeaderWithdraw,
        EventFamily::LeaderSignal,
    ];

    /// Contract event name, also used as the EventLog `event_name`.
    pub fn name(&self) -> &'static str {
        match self {
            EventFamily::LeaderRegistered => "LeaderRegistered",
            EventFamily::Subscribed => "Subscribed",
            EventFamily::Unsubscribed => "Unsubscribed",
            EventFamily::FollowerMirrored => "FollowerMirrored",
            EventFamily::FollowerPnLSettled => "FollowerPnLSettled",
            EventFamily::LeaderFeesAccrued => "LeaderFeesAccrued",
            EventFamily::LeaderWithdraw => "LeaderWithdraw",
            EventFamily::LeaderSignal => "LeaderSignal",
        }
    }
}

impl std::fmt::Display for EventFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Trade action carried by leader signals and follower mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    OpenLong,
    OpenShort,
    Close,
}

impl SignalAction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SignalAction::OpenLong),
            1 => Some(SignalAction::OpenShort),
            2 => Some(SignalAction::Close),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "OPEN_LONG" => Some(SignalAction::OpenLong),
            "OPEN_SHORT" => Some(SignalAction::OpenShort),
            "CLOSE" => Some(SignalAction::Close),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            SignalAction::OpenLong => 0,
            SignalAction::OpenShort => 1,
            SignalAction::Close => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::OpenLong => "OPEN_LONG",
            SignalAction::OpenShort => "OPEN_SHORT",
            SignalAction::Close => "CLOSE",
        }
    }
}

/// A decoded contract event. Monetary fields stay in ledger fixed-point units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    LeaderRegistered {
        leader_id: LeaderId,
        leader: Address,
        meta: String,
        fee_bps: u16,
    },
    Subscribed {
        leader_id: LeaderId,
        follower: Address,
        amount: U256,
    },
    Unsubscribed {
        leader_id: LeaderId,
        follower: Address,
        amount: U256,
    },
    FollowerMirrored {
        leader_id: LeaderId,
        follower: Address,
        action: SignalAction,
        size_usd: U256,
        is_long: bool,
        entry_price: U256,
        index_token: Address,
    },
    FollowerPnLSettled {
        leader_id: LeaderId,
        follower: Address,
        pnl_usd: I256,
    },
    LeaderFeesAccrued {
        leader_id: LeaderId,
        amount: U256,
    },
    LeaderWithdraw {
        leader_id: LeaderId,
        to: Address,
        amount: U256,
    },
    LeaderSignal {
        leader_id: LeaderId,
        action: SignalAction,
        size_usd: U256,
        is_long: bool,
        index_token: Address,
        entry_price: U256,
    },
}

impl LedgerEvent {
    pub fn family(&self) -> EventFamily {
        match self {
            LedgerEvent::LeaderRegistered { .. } => EventFamily::LeaderRegistered,
            LedgerEvent::Subscribed { .. } => EventFamily::Subscribed,
            LedgerEvent::Unsubscribed { .. } => EventFamily::Unsubscribed,
            LedgerEvent::FollowerMirrored { .. } => EventFamily::FollowerMirrored,
            LedgerEvent::FollowerPnLSettled { .. } => EventFamily::FollowerPnLSettled,
            LedgerEvent::LeaderFeesAccrued { .. } => EventFamily::LeaderFeesAccrued,
            LedgerEvent::LeaderWithdraw { .. } => EventFamily::LeaderWithdraw,
            LedgerEvent::LeaderSignal { .. } => EventFamily::LeaderSignal,
        }
    }

    pub fn leader_id(&self) -> LeaderId {
        match self {
            LedgerEvent::LeaderRegistered { leader_id, .. }
            | LedgerEvent::Subscribed { leader_id, .. }
            | LedgerEvent::Unsubscribed { leader_id, .. }
            | LedgerEvent::FollowerMirrored { leader_id, .. }
            | LedgerEvent::FollowerPnLSettled { leader_id, .. }
            | LedgerEvent::LeaderFeesAccrued { leader_id, .. }
            | LedgerEvent::LeaderWithdraw { leader_id, .. }
            | LedgerEvent::LeaderSignal { leader_id, .. } => *leader_id,
        }
    }

    /// Decoded arguments for the audit log. Numeric values are strings so
    /// 256-bit amounts survive JSON.
    pub fn args_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            LedgerEvent::LeaderRegistered {
                leader_id,
                leader,
                meta,
                fee_bps,
            } => json!({
                "leaderId": leader_id.0.to_string(),
                "leader": leader.as_str(),
                "meta": meta,
                "feeBps": fee_bps.to_string(),
            }),
            LedgerEvent::Subscribed {
                leader_id,
                follower,
                amount,
            }
            | LedgerEvent::Unsubscribed {
                leader_id,
                follower,
                amount,
            } => json!({
                "leaderId": leader_id.0.to_string(),
                "follower": follower.as_str(),
                "amount": amount.to_string(),
            }),
            LedgerEvent::FollowerMirrored {
                leader_id,
                follower,
                action,
                size_usd,
                is_long,
                entry_price,
                index_token,
            } => json!({
                "leaderId": leader_id.0.to_string(),
                "follower": follower.as_str(),
                "action": action.as_str(),
                "sizeUsd": size_usd.to_string(),
                "isLong": is_long,
                "entryPrice": entry_price.to_string(),
                "indexToken": index_token.as_str(),
            }),
            LedgerEvent::FollowerPnLSettled {
                leader_id,
                follower,
                pnl_usd,
            } => json!({
                "leaderId": leader_id.0.to_string(),
                "follower": follower.as_str(),
                "pnlUsd": pnl_usd.to_string(),
            }),
            LedgerEvent::LeaderFeesAccrued { leader_id, amount } => json!({
                "leaderId": leader_id.0.to_string(),
                "amount": amount.to_string(),
            }),
            LedgerEvent::LeaderWithdraw {
                leader_id,
                to,
                amount,
            } => json!({
                "leaderId": leader_id.0.to_string(),
                "to": to.as_str(),
                "amount": amount.to_string(),
            }),
            LedgerEvent::LeaderSignal {
                leader_id,
                action,
                size_usd,
                is_long,
                index_token,
                entry_price,
            } => json!({
                "leaderId": leader_id.0.to_string(),
                "action": action.as_str(),
                "sizeUsd": size_usd.to_string(),
                "isLong": is_long,
                "indexToken": index_token.as_str(),
                "entryPrice": entry_price.to_string(),
            }),
        }
    }
}

/// Where a log sits in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMeta {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub log_index: u64,
}

/// A decoded event together with its chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub event: LedgerEvent,
    pub meta: LogMeta,
}

impl DecodedLog {
    /// Key used by the idempotency guard, scoped per event family.
    ///
    /// One leader open emits a mirror event per follower in the same
    /// transaction, so mirror keys include the follower. Settlement keys do
    /// too, which keeps batched settlements from shadowing each other.
    pub fn idempotency_key(&self) -> String {
        match &self.event {
            LedgerEvent::FollowerMirrored {
                leader_id,
                follower,
                ..
            }
            | LedgerEvent::FollowerPnLSettled {
                leader_id,
                follower,
                ..
            } => format!("{}:{}:{}", self.meta.tx_hash, leader_id, follower),
            _ => self.meta.tx_hash.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn meta(tx: &str) -> LogMeta {
        LogMeta {
            tx_hash: TxHash::new(tx.to_string()),
            block_number: 10,
            log_index: 0,
        }
    }

    fn follower() -> Address {
        Address::from_str("0x00000000000000000000000000000000000000f1").unwrap()
    }

    #[test]
    fn test_idempotency_key_plain_tx_hash() {
        let log = DecodedLog {
            event: LedgerEvent::Subscribed {
                leader_id: LeaderId::new(1),
                follower: follower(),
                amount: U256::from(5u8),
            },
            meta: meta("0xAA"),
        };
        assert_eq!(log.idempotency_key(), "0xaa");
    }

    #[test]
    fn test_idempotency_key_mirror_scoped_to_follower() {
        let log = DecodedLog {
            event: LedgerEvent::FollowerMirrored {
                leader_id: LeaderId::new(7),
                follower: follower(),
                action: SignalAction::OpenLong,
                size_usd: U256::from(1u8),
                is_long: true,
                entry_price: U256::from(1u8),
                index_token: follower(),
            },
            meta: meta("0xbb"),
        };
        assert_eq!(
            log.idempotency_key(),
            "0xbb:7:0x00000000000000000000000000000000000000f1"
        );
    }

    #[test]
    fn test_args_json_stringifies_amounts() {
        let event = LedgerEvent::FollowerPnLSettled {
            leader_id: LeaderId::new(3),
            follower: follower(),
            pnl_usd: I256::from_dec_str("-100000000000000000000").unwrap(),
        };
        let args = event.args_json();
        assert_eq!(args["pnlUsd"], "-100000000000000000000");
        assert_eq!(args["leaderId"], "3");
    }

    #[test]
    fn test_signal_action_codes() {
        for action in [
            SignalAction::OpenLong,
            SignalAction::OpenShort,
            SignalAction::Close,
        ] {
            assert_eq!(SignalAction::from_u8(action.as_u8()), Some(action));
            assert_eq!(SignalAction::from_name(action.as_str()), Some(action));
        }
        assert_eq!(SignalAction::from_u8(9), None);
    }
}
