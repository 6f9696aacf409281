//! In-memory ledger for tests and local runs without a node.

use super::{abi, LedgerClient, LedgerError, RawLog, SettlementCall};
use crate::domain::{Address, EventFamily, LeaderId, LedgerEvent, TxHash};
use alloy_primitives::U256;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

impl RawLog {
    /// ABI-encode a typed event into a raw log at the given chain position.
    pub fn from_event(
        event: &LedgerEvent,
        tx_hash: &str,
        block_number: u64,
        log_index: u64,
    ) -> Result<Self, LedgerError> {
        let (topics, data) = abi::encode_event_log(event)
            .map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;
        Ok(RawLog {
            topics,
            data,
            args: None,
            tx_hash: TxHash::new(tx_hash.to_string()),
            block_number,
            log_index,
        })
    }
}

/// Mock ledger that serves predefined logs and deposit values and records
/// every settlement submitted to it.
#[derive(Debug, Default)]
pub struct MockLedgerClient {
    logs: Mutex<HashMap<EventFamily, Vec<RawLog>>>,
    latest_block: Mutex<u64>,
    deposits: Mutex<HashMap<(LeaderId, Address), U256>>,
    failing_reads: HashSet<Address>,
    failing_followers: HashSet<Address>,
    hanging_followers: HashSet<Address>,
    hanging_released: Mutex<bool>,
    submissions: Mutex<Vec<SettlementCall>>,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a log; the latest block advances to cover it.
    pub fn with_log(self, family: EventFamily, log: RawLog) -> Self {
        self.push_log(family, log);
        self
    }

    pub fn with_deposit(self, leader_id: LeaderId, follower: Address, amount: U256) -> Self {
        self.set_deposit(leader_id, follower, amount);
        self
    }

    /// Deposit reads for this follower fail with a network error.
    pub fn with_failing_read(mut self, follower: Address) -> Self {
        self.failing_reads.insert(follower);
        self
    }

    /// Settlements for this follower are rejected by the node.
    pub fn with_failing_follower(mut self, follower: Address) -> Self {
        self.failing_followers.insert(follower);
        self
    }

    /// Settlements for this follower are accepted but never confirm.
    pub fn with_hanging_follower(mut self, follower: Address) -> Self {
        self.hanging_followers.insert(follower);
        self
    }

    /// Transactions from hanging followers confirm from now on.
    pub fn release_hanging(&self) {
        if let Ok(mut released) = self.hanging_released.lock() {
            *released = true;
        }
    }

    pub fn push_log(&self, family: EventFamily, log: RawLog) {
        if let Ok(mut latest) = self.latest_block.lock() {
            *latest = (*latest).max(log.block_number);
        }
        if let Ok(mut logs) = self.logs.lock() {
            logs.entry(family).or_default().push(log);
        }
    }

    pub fn set_deposit(&self, leader_id: LeaderId, follower: Address, amount: U256) {
        if let Ok(mut deposits) = self.deposits.lock() {
            deposits.insert((leader_id, follower), amount);
        }
    }

    /// Settlements submitted so far, in order.
    pub fn submissions(&self) -> Vec<SettlementCall> {
        self.submissions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn poisoned() -> LedgerError {
        LedgerError::Network("mock state poisoned".to_string())
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        self.latest_block
            .lock()
            .map(|latest| *latest)
            .map_err(|_| Self::poisoned())
    }

    async fn fetch_logs(
        &self,
        family: EventFamily,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, LedgerError> {
        let logs = self.logs.lock().map_err(|_| Self::poisoned())?;
        let mut matching: Vec<RawLog> = logs
            .get(&family)
            .map(|logs| {
                logs.iter()
                    .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(matching)
    }

    async fn read_deposit(
        &self,
        leader_id: LeaderId,
        follower: &Address,
    ) -> Result<U256, LedgerError> {
        if self.failing_reads.contains(follower) {
            return Err(LedgerError::Network("connection refused".to_string()));
        }
        let deposits = self.deposits.lock().map_err(|_| Self::poisoned())?;
        Ok(deposits
            .get(&(leader_id, follower.clone()))
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn submit_settlement(&self, call: &SettlementCall) -> Result<TxHash, LedgerError> {
        if self.failing_followers.contains(&call.follower) {
            return Err(LedgerError::Rpc {
                code: -32000,
                message: "execution reverted".to_string(),
            });
        }
        let mut submissions = self.submissions.lock().map_err(|_| Self::poisoned())?;
        submissions.push(call.clone());
        let tx = if self.hanging_followers.contains(&call.follower) {
            format!("0xhang{:04x}", submissions.len())
        } else {
            format!("0xsettle{:04x}", submissions.len())
        };
        Ok(TxHash::new(tx))
    }

    async fn confirm_transaction(&self, tx_hash: &TxHash) -> Result<(), LedgerError> {
        let released = *self.hanging_released.lock().map_err(|_| Self::poisoned())?;
        if tx_hash.as_str().starts_with("0xhang") && !released {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}
