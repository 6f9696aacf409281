//! Ledger client abstraction: log retrieval, deposit reads and settlement writes.

use crate::domain::{Address, EventFamily, LeaderId, TxHash};
use alloy_primitives::{B256, I256, U256};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub mod abi;
pub mod decode;
pub mod mock;
pub mod rpc;
pub mod subscription;

pub use decode::{decode_log, DecodeError};
pub use mock::MockLedgerClient;
pub use rpc::JsonRpcLedgerClient;
pub use subscription::{subscribe, LogStream, SubscriptionOptions};

/// A log entry as delivered by the chain, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    /// Arguments already decoded by the delivery layer, if it provides them.
    pub args: Option<serde_json::Value>,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub log_index: u64,
}

/// One follower settlement written back to the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementCall {
    pub leader_id: LeaderId,
    pub follower: Address,
    /// Signed P&L in ledger fixed-point units.
    pub pnl: I256,
}

/// Client for the copy-trading contract.
///
/// Implementations are constructed once at startup and shared by `Arc`
/// across the per-family watchers.
#[async_trait]
pub trait LedgerClient: Send + Sync + fmt::Debug {
    /// Highest block currently available for log queries.
    async fn latest_block(&self) -> Result<u64, LedgerError>;

    /// Fetch logs of one family within an inclusive block range, ordered by
    /// (block_number, log_index).
    async fn fetch_logs(
        &self,
        family: EventFamily,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, LedgerError>;

    /// Current `deposits(leaderId, follower)` value in fixed-point units.
    async fn read_deposit(
        &self,
        leader_id: LeaderId,
        follower: &Address,
    ) -> Result<U256, LedgerError>;

    /// Submit a settlement transaction and return its hash once accepted.
    async fn submit_settlement(&self, call: &SettlementCall) -> Result<TxHash, LedgerError>;

    /// Wait until the transaction is mined. Reverted transactions are errors.
    async fn confirm_transaction(&self, tx_hash: &TxHash) -> Result<(), LedgerError>;
}

/// Error type for ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Connection failure, DNS, timeouts at the transport layer
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Rate limited")]
    RateLimited,
    /// JSON-RPC error object returned by the node (includes rejected writes)
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Transaction {0} reverted")]
    Reverted(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::Http {
            status: 503,
            message: "Server error".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 503: Server error");

        let err = LedgerError::Rpc {
            code: -32000,
            message: "nonce too low".to_string(),
        };
        assert_eq!(err.to_string(), "RPC error -32000: nonce too low");

        assert_eq!(LedgerError::RateLimited.to_string(), "Rate limited");
    }
}
