//! Event decoding: raw log entries into [`LedgerEvent`] values.
//!
//! Pre-decoded arguments supplied by the delivery layer are preferred. When they
//! are missing or empty, topics and data are decoded against the contract ABI.

use crate::domain::{Address, DecodedLog, EventFamily, LeaderId, LedgerEvent, LogMeta, SignalAction};
use crate::ledger::abi;
use crate::ledger::RawLog;
use alloy_primitives::{I256, U256};
use alloy_sol_types::SolEvent;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("log has no topics")]
    MissingTopic,
    #[error("topic0 does not match {0}")]
    TopicMismatch(EventFamily),
    #[error("abi decode failed: {0}")]
    Abi(String),
    #[error("missing argument {0}")]
    MissingField(&'static str),
    #[error("invalid argument {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
    #[error("unknown action code {0}")]
    UnknownAction(u8),
}

/// Decode one log of the given family.
pub fn decode_log(family: EventFamily, log: &RawLog) -> Result<DecodedLog, DecodeError> {
    let event = match log.args.as_ref().filter(|args| has_args(args)) {
        Some(args) => decode_args(family, args)?,
        None => decode_abi(family, log)?,
    };

    Ok(DecodedLog {
        event,
        meta: LogMeta {
            tx_hash: log.tx_hash.clone(),
            block_number: log.block_number,
            log_index: log.log_index,
        },
    })
}

fn has_args(args: &Value) -> bool {
    match args {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

fn decode_abi(family: EventFamily, log: &RawLog) -> Result<LedgerEvent, DecodeError> {
    let topic0 = log.topics.first().ok_or(DecodeError::MissingTopic)?;
    if *topic0 != abi::signature_hash(family) {
        return Err(DecodeError::TopicMismatch(family));
    }
    let topics = log.topics.iter().copied();
    let data = log.data.as_slice();

    let event = match family {
        EventFamily::LeaderRegistered => {
            let ev = abi::LeaderRegistered::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::LeaderRegistered {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                leader: Address::from(ev.leader),
                meta: ev.meta,
                fee_bps: ev.feeBps,
            }
        }
        EventFamily::Subscribed => {
            let ev = abi::Subscribed::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::Subscribed {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                follower: Address::from(ev.follower),
                amount: ev.amount,
            }
        }
        EventFamily::Unsubscribed => {
            let ev = abi::Unsubscribed::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::Unsubscribed {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                follower: Address::from(ev.follower),
                amount: ev.amount,
            }
        }
        EventFamily::FollowerMirrored => {
            let ev = abi::FollowerMirrored::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::FollowerMirrored {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                follower: Address::from(ev.follower),
                action: action_from_code(ev.action)?,
                size_usd: ev.sizeUsd,
                is_long: ev.isLong,
                entry_price: ev.entryPrice,
                index_token: Address::from(ev.indexToken),
            }
        }
        EventFamily::FollowerPnLSettled => {
            let ev =
                abi::FollowerPnLSettled::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::FollowerPnLSettled {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                follower: Address::from(ev.follower),
                pnl_usd: ev.pnlUsd,
            }
        }
        EventFamily::LeaderFeesAccrued => {
            let ev = abi::LeaderFeesAccrued::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::LeaderFeesAccrued {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                amount: ev.amount,
            }
        }
        EventFamily::LeaderWithdraw => {
            let ev = abi::LeaderWithdraw::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::LeaderWithdraw {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                to: Address::from(ev.to),
                amount: ev.amount,
            }
        }
        EventFamily::LeaderSignal => {
            let ev = abi::LeaderSignal::decode_raw_log(topics, data, true).map_err(abi_err)?;
            LedgerEvent::LeaderSignal {
                leader_id: leader_id_from_u256(ev.leaderId)?,
                action: action_from_code(ev.action)?,
                size_usd: ev.sizeUsd,
                is_long: ev.isLong,
                index_token: Address::from(ev.indexToken),
                entry_price: ev.entryPrice,
            }
        }
    };

    Ok(event)
}

fn abi_err(e: alloy_sol_types::Error) -> DecodeError {
    DecodeError::Abi(e.to_string())
}

fn leader_id_from_u256(value: U256) -> Result<LeaderId, DecodeError> {
    u64::from_str(&value.to_string())
        .map(LeaderId::new)
        .map_err(|_| DecodeError::InvalidField {
            field: "leaderId",
            message: format!("{} exceeds u64", value),
        })
}

fn action_from_code(code: u8) -> Result<SignalAction, DecodeError> {
    SignalAction::from_u8(code).ok_or(DecodeError::UnknownAction(code))
}

fn decode_args(family: EventFamily, args: &Value) -> Result<LedgerEvent, DecodeError> {
    let event = match family {
        EventFamily::LeaderRegistered => LedgerEvent::LeaderRegistered {
            leader_id: arg_leader_id(args)?,
            leader: arg_address(args, "leader")?,
            meta: arg_string(args, "meta").unwrap_or_default(),
            fee_bps: arg_u16_or_zero(args, "feeBps")?,
        },
        EventFamily::Subscribed => LedgerEvent::Subscribed {
            leader_id: arg_leader_id(args)?,
            follower: arg_address(args, "follower")?,
            amount: arg_u256(args, "amount")?,
        },
        EventFamily::Unsubscribed => LedgerEvent::Unsubscribed {
            leader_id: arg_leader_id(args)?,
            follower: arg_address(args, "follower")?,
            amount: arg_u256(args, "amount")?,
        },
        EventFamily::FollowerMirrored => LedgerEvent::FollowerMirrored {
            leader_id: arg_leader_id(args)?,
            follower: arg_address(args, "follower")?,
            action: arg_action(args)?,
            size_usd: arg_u256(args, "sizeUsd")?,
            is_long: arg_bool(args, "isLong")?,
            entry_price: arg_u256(args, "entryPrice")?,
            index_token: arg_address(args, "indexToken")?,
        },
        EventFamily::FollowerPnLSettled => LedgerEvent::FollowerPnLSettled {
            leader_id: arg_leader_id(args)?,
            follower: arg_address(args, "follower")?,
            pnl_usd: arg_i256(args, "pnlUsd")?,
        },
        EventFamily::LeaderFeesAccrued => LedgerEvent::LeaderFeesAccrued {
            leader_id: arg_leader_id(args)?,
            amount: arg_u256(args, "amount")?,
        },
        EventFamily::LeaderWithdraw => LedgerEvent::LeaderWithdraw {
            leader_id: arg_leader_id(args)?,
            to: arg_address(args, "to")?,
            amount: arg_u256(args, "amount")?,
        },
        EventFamily::LeaderSignal => LedgerEvent::LeaderSignal {
            leader_id: arg_leader_id(args)?,
            action: arg_action(args)?,
            size_usd: arg_u256(args, "sizeUsd")?,
            is_long: arg_bool(args, "isLong")?,
            index_token: arg_address(args, "indexToken")?,
            entry_price: arg_u256(args, "entryPrice")?,
        },
    };
    Ok(event)
}

/// Numeric arguments arrive as JSON strings (bigint-safe) or plain numbers.
fn arg_numeric(args: &Value, field: &'static str) -> Result<String, DecodeError> {
    match args.get(field) {
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(DecodeError::InvalidField {
            field,
            message: format!("expected number, got {}", other),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn arg_string(args: &Value, field: &'static str) -> Option<String> {
    args.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

fn arg_u256(args: &Value, field: &'static str) -> Result<U256, DecodeError> {
    let raw = arg_numeric(args, field)?;
    U256::from_str(&raw).map_err(|e| DecodeError::InvalidField {
        field,
        message: e.to_string(),
    })
}

fn arg_i256(args: &Value, field: &'static str) -> Result<I256, DecodeError> {
    let raw = arg_numeric(args, field)?;
    I256::from_dec_str(&raw).map_err(|e| DecodeError::InvalidField {
        field,
        message: e.to_string(),
    })
}

fn arg_leader_id(args: &Value) -> Result<LeaderId, DecodeError> {
    leader_id_from_u256(arg_u256(args, "leaderId")?)
}

fn arg_u16_or_zero(args: &Value, field: &'static str) -> Result<u16, DecodeError> {
    if args.get(field).is_none() {
        return Ok(0);
    }
    let raw = arg_numeric(args, field)?;
    raw.parse::<u16>().map_err(|e| DecodeError::InvalidField {
        field,
        message: e.to_string(),
    })
}

fn arg_address(args: &Value, field: &'static str) -> Result<Address, DecodeError> {
    let raw = args
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingField(field))?;
    Address::from_str(raw).map_err(|e| DecodeError::InvalidField {
        field,
        message: e.to_string(),
    })
}

fn arg_bool(args: &Value, field: &'static str) -> Result<bool, DecodeError> {
    match args.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s == "true" => Ok(true),
        Some(Value::String(s)) if s == "false" => Ok(false),
        Some(other) => Err(DecodeError::InvalidField {
            field,
            message: format!("expected bool, got {}", other),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn arg_action(args: &Value) -> Result<SignalAction, DecodeError> {
    if let Some(action) = args
        .get("action")
        .and_then(|v| v.as_str())
        .and_then(SignalAction::from_name)
    {
        return Ok(action);
    }
    match args.get("action") {
        Some(_) => {
            let raw = arg_numeric(args, "action")?;
            let code = raw.parse::<u8>().map_err(|e| DecodeError::InvalidField {
                field: "action",
                message: e.to_string(),
            })?;
            action_from_code(code)
        }
        None => Err(DecodeError::MissingField("action")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TxHash;
    use serde_json::json;

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    fn raw_from_event(event: &LedgerEvent) -> RawLog {
        let (topics, data) = abi::encode_event_log(event).unwrap();
        RawLog {
            topics,
            data,
            args: None,
            tx_hash: TxHash::new("0xabc".to_string()),
            block_number: 12,
            log_index: 3,
        }
    }

    #[test]
    fn test_decode_abi_fallback_mirror() {
        let event = LedgerEvent::FollowerMirrored {
            leader_id: LeaderId::new(2),
            follower: addr("0x00000000000000000000000000000000000000f1"),
            action: SignalAction::OpenShort,
            size_usd: U256::from(300u64),
            is_long: false,
            entry_price: U256::from(3000u64),
            index_token: addr("0x00000000000000000000000000000000000000e7"),
        };
        let decoded = decode_log(EventFamily::FollowerMirrored, &raw_from_event(&event)).unwrap();
        assert_eq!(decoded.event, event);
        assert_eq!(decoded.meta.block_number, 12);
        assert_eq!(decoded.meta.log_index, 3);
    }

    #[test]
    fn test_decode_abi_signed_pnl() {
        let event = LedgerEvent::FollowerPnLSettled {
            leader_id: LeaderId::new(1),
            follower: addr("0x00000000000000000000000000000000000000f1"),
            pnl_usd: I256::from_dec_str("-100000000000000000000").unwrap(),
        };
        let decoded =
            decode_log(EventFamily::FollowerPnLSettled, &raw_from_event(&event)).unwrap();
        assert_eq!(decoded.event, event);
    }

    #[test]
    fn test_decode_prefers_predecoded_args() {
        let mut raw = raw_from_event(&LedgerEvent::Subscribed {
            leader_id: LeaderId::new(1),
            follower: addr("0x00000000000000000000000000000000000000f1"),
            amount: U256::from(1u8),
        });
        raw.args = Some(json!({
            "leaderId": "1",
            "follower": "0x00000000000000000000000000000000000000F1",
            "amount": "100000000000000000000"
        }));

        let decoded = decode_log(EventFamily::Subscribed, &raw).unwrap();
        match decoded.event {
            LedgerEvent::Subscribed { amount, .. } => {
                assert_eq!(amount, U256::from_str("100000000000000000000").unwrap())
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_empty_args_fall_back_to_abi() {
        let event = LedgerEvent::LeaderFeesAccrued {
            leader_id: LeaderId::new(9),
            amount: U256::from(77u64),
        };
        let mut raw = raw_from_event(&event);
        raw.args = Some(json!({}));
        assert_eq!(
            decode_log(EventFamily::LeaderFeesAccrued, &raw).unwrap().event,
            event
        );
    }

    #[test]
    fn test_predecoded_signal_accepts_action_name() {
        let raw = RawLog {
            topics: vec![],
            data: vec![],
            args: Some(json!({
                "leaderId": 5,
                "action": "CLOSE",
                "sizeUsd": "0",
                "isLong": true,
                "indexToken": "0x00000000000000000000000000000000000000e7",
                "entryPrice": "3300000000000000000000"
            })),
            tx_hash: TxHash::new("0x1".to_string()),
            block_number: 1,
            log_index: 0,
        };
        let decoded = decode_log(EventFamily::LeaderSignal, &raw).unwrap();
        assert!(matches!(
            decoded.event,
            LedgerEvent::LeaderSignal {
                action: SignalAction::Close,
                ..
            }
        ));
    }

    #[test]
    fn test_topic_mismatch_is_an_error() {
        let raw = raw_from_event(&LedgerEvent::LeaderFeesAccrued {
            leader_id: LeaderId::new(9),
            amount: U256::from(77u64),
        });
        assert_eq!(
            decode_log(EventFamily::LeaderWithdraw, &raw),
            Err(DecodeError::TopicMismatch(EventFamily::LeaderWithdraw))
        );
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let mut raw = raw_from_event(&LedgerEvent::LeaderFeesAccrued {
            leader_id: LeaderId::new(9),
            amount: U256::from(77u64),
        });
        raw.data.truncate(4);
        assert!(matches!(
            decode_log(EventFamily::LeaderFeesAccrued, &raw),
            Err(DecodeError::Abi(_))
        ));
    }

    #[test]
    fn test_missing_predecoded_field() {
        let raw = RawLog {
            topics: vec![],
            data: vec![],
            args: Some(json!({ "leaderId": "1" })),
            tx_hash: TxHash::new("0x1".to_string()),
            block_number: 1,
            log_index: 0,
        };
        assert_eq!(
            decode_log(EventFamily::LeaderFeesAccrued, &raw),
            Err(DecodeError::MissingField("amount"))
        );
    }
}
