//! JSON-RPC ledger client.

use super::{abi, LedgerClient, LedgerError, RawLog, SettlementCall};
use crate::domain::{Address, EventFamily, LeaderId, TxHash};
use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Ledger client speaking Ethereum JSON-RPC over HTTP.
///
/// Settlement transactions are sent with `eth_sendTransaction` from an
/// account the node manages, so no key material lives in this process.
#[derive(Debug)]
pub struct JsonRpcLedgerClient {
    client: Client,
    url: String,
    contract: Address,
    sender: Address,
    next_id: AtomicU64,
}

impl JsonRpcLedgerClient {
    pub fn new(url: String, contract: Address, sender: Address) -> Self {
        Self {
            client: Client::new(),
            url,
            contract,
            sender,
            next_id: AtomicU64::new(1),
        }
    }

    fn request_body(&self, method: &str, params: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        })
    }

    /// Read-only call, retried with exponential backoff on transient failures.
    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let body = self.request_body(method, &params);
            self.send(&body).await.map_err(|e| match e {
                LedgerError::Network(_) | LedgerError::RateLimited => {
                    backoff::Error::transient(e)
                }
                LedgerError::Http { status, .. } if status >= 500 => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        })
        .await
    }

    /// Single attempt. Used for writes, where a blind retry could double-submit.
    async fn call_once(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let body = self.request_body(method, &params);
        self.send(&body).await
    }

    async fn send(&self, body: &Value) -> Result<Value, LedgerError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        let status = response.status();
        if status == 429 {
            return Err(LedgerError::RateLimited);
        }
        if status.is_server_error() {
            return Err(LedgerError::Http {
                status: status.as_u16(),
                message: "Server error".to_string(),
            });
        }
        if !status.is_success() {
            return Err(LedgerError::Http {
                status: status.as_u16(),
                message: "Client error".to_string(),
            });
        }

        let envelope = response
            .json::<Value>()
            .await
            .map_err(|e| LedgerError::Parse(e.to_string()))?;
        unwrap_envelope(envelope)
    }
}

fn unwrap_envelope(mut envelope: Value) -> Result<Value, LedgerError> {
    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        return Err(LedgerError::Rpc {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    envelope
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| LedgerError::Parse("Missing result field".to_string()))
}

fn hex_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

fn parse_quantity(value: &Value, field: &str) -> Result<u64, LedgerError> {
    let raw = value
        .as_str()
        .ok_or_else(|| LedgerError::Parse(format!("Missing {} field", field)))?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::Parse(format!("Invalid {}: {}", field, e)))
}

fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>, LedgerError> {
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .map_err(|e| LedgerError::Parse(format!("Invalid hex data: {}", e)))
}

/// Convert one `eth_getLogs` entry. Returns `None` for logs removed by a reorg.
fn parse_log(log_json: &Value) -> Result<Option<RawLog>, LedgerError> {
    if log_json.get("removed").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(None);
    }

    let topics = log_json
        .get("topics")
        .and_then(|v| v.as_array())
        .ok_or_else(|| LedgerError::Parse("Missing topics field".to_string()))?
        .iter()
        .map(|t| {
            t.as_str()
                .and_then(|s| B256::from_str(s).ok())
                .ok_or_else(|| LedgerError::Parse(format!("Invalid topic: {}", t)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let data = parse_hex_bytes(log_json.get("data").and_then(|v| v.as_str()).unwrap_or("0x"))?;

    let tx_hash = log_json
        .get("transactionHash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::Parse("Missing transactionHash field".to_string()))?;

    Ok(Some(RawLog {
        topics,
        data,
        args: None,
        tx_hash: TxHash::new(tx_hash.to_string()),
        block_number: parse_quantity(&log_json["blockNumber"], "blockNumber")?,
        log_index: parse_quantity(&log_json["logIndex"], "logIndex")?,
    }))
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result, "blockNumber")
    }

    async fn fetch_logs(
        &self,
        family: EventFamily,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, LedgerError> {
        debug!(
            "Fetching {} logs from_block={}, to_block={}",
            family, from_block, to_block
        );

        let filter = json!([{
            "address": self.contract.as_str(),
            "topics": [abi::signature_hash(family).to_string()],
            "fromBlock": hex_quantity(from_block),
            "toBlock": hex_quantity(to_block),
        }]);
        let result = self.call("eth_getLogs", filter).await?;

        let logs_json = result
            .as_array()
            .ok_or_else(|| LedgerError::Parse("Expected array response".to_string()))?;

        let mut logs = Vec::with_capacity(logs_json.len());
        for log_json in logs_json {
            match parse_log(log_json) {
                Ok(Some(log)) => logs.push(log),
                Ok(None) => {}
                Err(e) => warn!("Failed to parse log: {}", e),
            }
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn read_deposit(
        &self,
        leader_id: LeaderId,
        follower: &Address,
    ) -> Result<U256, LedgerError> {
        let follower = follower
            .to_alloy()
            .map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;
        let data = abi::encode_deposits_call(leader_id.to_u256(), follower);
        let params = json!([
            {
                "to": self.contract.as_str(),
                "data": format!("0x{}", hex::encode(data)),
            },
            "latest"
        ]);

        let result = self.call("eth_call", params).await?;
        let bytes = parse_hex_bytes(
            result
                .as_str()
                .ok_or_else(|| LedgerError::Parse("Expected hex result".to_string()))?,
        )?;
        abi::decode_deposits_return(&bytes).map_err(|e| LedgerError::Parse(e.to_string()))
    }

    async fn submit_settlement(&self, call: &SettlementCall) -> Result<TxHash, LedgerError> {
        let data = abi::encode_settlement_call(call)
            .map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;
        let params = json!([{
            "from": self.sender.as_str(),
            "to": self.contract.as_str(),
            "data": format!("0x{}", hex::encode(data)),
        }]);

        let result = self.call_once("eth_sendTransaction", params).await?;
        result
            .as_str()
            .map(|s| TxHash::new(s.to_string()))
            .ok_or_else(|| LedgerError::Parse("Expected transaction hash".to_string()))
    }

    async fn confirm_transaction(&self, tx_hash: &TxHash) -> Result<(), LedgerError> {
        loop {
            let receipt = self
                .call("eth_getTransactionReceipt", json!([tx_hash.as_str()]))
                .await?;
            if receipt.is_null() {
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                continue;
            }
            return match receipt.get("status").and_then(|s| s.as_str()) {
                Some("0x1") => Ok(()),
                Some(_) => Err(LedgerError::Reverted(tx_hash.to_string())),
                None => Err(LedgerError::Parse("Missing receipt status".to_string())),
            };
        }
    }
}
