//! Contract interface: event signatures, the deposit view and the settlement call.

use crate::domain::{EventFamily, LedgerEvent};
use crate::ledger::SettlementCall;
use alloy_primitives::{B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};

sol! {
    event LeaderRegistered(uint256 indexed leaderId, address indexed leader, string meta, uint16 feeBps);
    event Subscribed(uint256 indexed leaderId, address indexed follower, uint256 amount);
    event Unsubscribed(uint256 indexed leaderId, address indexed follower, uint256 amount);
    event FollowerMirrored(
        uint256 indexed leaderId,
        address indexed follower,
        uint8 action,
        uint256 sizeUsd,
        bool isLong,
        uint256 entryPrice,
        address indexToken
    );
    event FollowerPnLSettled(uint256 indexed leaderId, address indexed follower, int256 pnlUsd);
    event LeaderFeesAccrued(uint256 indexed leaderId, uint256 amount);
    event LeaderWithdraw(uint256 indexed leaderId, address indexed to, uint256 amount);
    event LeaderSignal(
        uint256 indexed leaderId,
        uint8 action,
        uint256 sizeUsd,
        bool isLong,
        address indexToken,
        uint256 entryPrice
    );

    function deposits(uint256 leaderId, address follower) external view returns (uint256 amount);
    function settleFollowerPnL(uint256 leaderId, address follower, int256 pnlUsd) external;
}

/// topic0 for an event family.
pub fn signature_hash(family: EventFamily) -> B256 {
    match family {
        EventFamily::LeaderRegistered => LeaderRegistered::SIGNATURE_HASH,
        EventFamily::Subscribed => Subscribed::SIGNATURE_HASH,
        EventFamily::Unsubscribed => Unsubscribed::SIGNATURE_HASH,
        EventFamily::FollowerMirrored => FollowerMirrored::SIGNATURE_HASH,
        EventFamily::FollowerPnLSettled => FollowerPnLSettled::SIGNATURE_HASH,
        EventFamily::LeaderFeesAccrued => LeaderFeesAccrued::SIGNATURE_HASH,
        EventFamily::LeaderWithdraw => LeaderWithdraw::SIGNATURE_HASH,
        EventFamily::LeaderSignal => LeaderSignal::SIGNATURE_HASH,
    }
}

pub fn encode_deposits_call(
    leader_id: U256,
    follower: alloy_primitives::Address,
) -> Vec<u8> {
    depositsCall {
        leaderId: leader_id,
        follower,
    }
    .abi_encode()
}

pub fn decode_deposits_return(data: &[u8]) -> Result<U256, alloy_sol_types::Error> {
    depositsCall::abi_decode_returns(data, true).map(|ret| ret.amount)
}

pub fn encode_settlement_call(
    call: &SettlementCall,
) -> Result<Vec<u8>, crate::domain::AddressParseError> {
    Ok(settleFollowerPnLCall {
        leaderId: call.leader_id.to_u256(),
        follower: call.follower.to_alloy()?,
        pnlUsd: call.pnl,
    }
    .abi_encode())
}

/// ABI-encode an event as `(topics, data)`, the inverse of the decoder's
/// fallback path. Used by the mock ledger and by tests.
pub fn encode_event_log(
    event: &LedgerEvent,
) -> Result<(Vec<B256>, Vec<u8>), crate::domain::AddressParseError> {
    let log_data = match event {
        LedgerEvent::LeaderRegistered {
            leader_id,
            leader,
            meta,
            fee_bps,
        } => LeaderRegistered {
            leaderId: leader_id.to_u256(),
            leader: leader.to_alloy()?,
            meta: meta.clone(),
            feeBps: *fee_bps,
        }
        .encode_log_data(),
        LedgerEvent::Subscribed {
            leader_id,
            follower,
            amount,
        } => Subscribed {
            leaderId: leader_id.to_u256(),
            follower: follower.to_alloy()?,
            amount: *amount,
        }
        .encode_log_data(),
        LedgerEvent::Unsubscribed {
            leader_id,
            follower,
            amount,
        } => Unsubscribed {
            leaderId: leader_id.to_u256(),
            follower: follower.to_alloy()?,
            amount: *amount,
        }
        .encode_log_data(),
        LedgerEvent::FollowerMirrored {
            leader_id,
            follower,
            action,
            size_usd,
            is_long,
            entry_price,
            index_token,
        } => FollowerMirrored {
            leaderId: leader_id.to_u256(),
            follower: follower.to_alloy()?,
            action: action.as_u8(),
            sizeUsd: *size_usd,
            isLong: *is_long,
            entryPrice: *entry_price,
            indexToken: index_token.to_alloy()?,
        }
        .encode_log_data(),
        LedgerEvent::FollowerPnLSettled {
            leader_id,
            follower,
            pnl_usd,
        } => FollowerPnLSettled {
            leaderId: leader_id.to_u256(),
            follower: follower.to_alloy()?,
            pnlUsd: *pnl_usd,
        }
        .encode_log_data(),
        LedgerEvent::LeaderFeesAccrued { leader_id, amount } => LeaderFeesAccrued {
            leaderId: leader_id.to_u256(),
            amount: *amount,
        }
        .encode_log_data(),
        LedgerEvent::LeaderWithdraw {
            leader_id,
            to,
            amount,
        } => LeaderWithdraw {
            leaderId: leader_id.to_u256(),
            to: to.to_alloy()?,
            amount: *amount,
        }
        .encode_log_data(),
        LedgerEvent::LeaderSignal {
            leader_id,
            action,
            size_usd,
            is_long,
            index_token,
            entry_price,
        } => LeaderSignal {
            leaderId: leader_id.to_u256(),
            action: action.as_u8(),
            sizeUsd: *size_usd,
            isLong: *is_long,
            indexToken: index_token.to_alloy()?,
            entryPrice: *entry_price,
        }
        .encode_log_data(),
    };

    Ok((log_data.topics().to_vec(), log_data.data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, LeaderId};
    use alloy_primitives::I256;
    use std::str::FromStr;

    #[test]
    fn test_signature_hashes_are_distinct() {
        let hashes: std::collections::HashSet<B256> =
            EventFamily::ALL.into_iter().map(signature_hash).collect();
        assert_eq!(hashes.len(), EventFamily::ALL.len());
    }

    #[test]
    fn test_subscribed_topic_layout() {
        let follower = Address::from_str("0x00000000000000000000000000000000000000f1").unwrap();
        let (topics, data) = encode_event_log(&LedgerEvent::Subscribed {
            leader_id: LeaderId::new(4),
            follower,
            amount: U256::from(100u64),
        })
        .unwrap();

        assert_eq!(topics.len(), 3);
        assert_eq!(topics[0], signature_hash(EventFamily::Subscribed));
        assert_eq!(topics[1], B256::from(U256::from(4u64)));
        assert_eq!(data.len(), 32);
    }

    #[test]
    fn test_deposits_return_decoding() {
        let encoded = U256::from(42u64).to_be_bytes::<32>();
        assert_eq!(decode_deposits_return(&encoded).unwrap(), U256::from(42u64));
    }

    #[test]
    fn test_settlement_call_selector() {
        let call = SettlementCall {
            leader_id: LeaderId::new(1),
            follower: Address::from_str("0x00000000000000000000000000000000000000f1").unwrap(),
            pnl: I256::from_dec_str("-5").unwrap(),
        };
        let data = encode_settlement_call(&call).unwrap();
        assert_eq!(&data[..4], settleFollowerPnLCall::SELECTOR.as_slice());
        assert_eq!(data.len(), 4 + 32 * 3);
    }
}
