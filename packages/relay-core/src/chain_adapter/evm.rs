use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{LedgerClient, RawLog, SourceLedger, TxReceipt};
use crate::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Ethereum-style JSON-RPC over HTTP. Serves both as a destination client and,
/// pointed at the Hedera JSON-RPC relay, as the source ledger.
pub struct JsonRpcClient {
    chain: String,
    rpc_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: String,
    transaction_hash: String,
    log_index: String,
    #[serde(default)]
    block_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptEntry {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
}

impl JsonRpcClient {
    pub fn new(chain: &str, rpc_url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client for {}: {}", chain, e)))?;
        Ok(Self {
            chain: chain.to_string(),
            rpc_url: rpc_url.to_string(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issues one JSON-RPC call; `Ok(None)` means the node answered `null`.
    async fn call(&self, method: &str, params: Value) -> Result<Option<Value>, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id
            }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Error::RateLimited {
                message: format!("{} rate limited {}", self.chain, method),
                retry_after,
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Authentication(format!("{} rejected credentials for {}", self.chain, method)));
        }
        if !status.is_success() {
            return Err(Error::Rpc(format!("{} returned HTTP {} for {}", self.chain, status, method)));
        }

        let body: RpcResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(self.classify(method, err));
        }
        Ok(body.result.filter(|v| !v.is_null()))
    }

    async fn call_required(&self, method: &str, params: Value) -> Result<Value, Error> {
        self.call(method, params)
            .await?
            .ok_or_else(|| Error::Rpc(format!("{} returned no result for {}", self.chain, method)))
    }

    fn classify(&self, method: &str, err: RpcError) -> Error {
        let message = err.message.to_lowercase();
        if message.contains("nonce too low") || message.contains("nonce too high") || message.contains("invalid nonce") {
            Error::NonceMismatch {
                chain: self.chain.clone(),
                message: err.message,
            }
        } else if message.contains("rate limit") || err.code == -32005 {
            Error::RateLimited {
                message: err.message,
                retry_after: None,
            }
        } else if message.contains("execution reverted")
            || message.contains("insufficient funds")
            || message.contains("intrinsic gas too low")
            || err.code == -32602
        {
            Error::Validation(format!("{} rejected {}: {}", self.chain, method, err.message))
        } else {
            Error::Rpc(format!("{} {} failed ({}): {}", self.chain, method, err.code, err.message))
        }
    }
}

pub(crate) fn parse_quantity(value: &str) -> Result<u64, Error> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Serialization(format!("Invalid hex quantity {}: {}", value, e)))
}

fn as_quantity(value: Value) -> Result<u64, Error> {
    value
        .as_str()
        .ok_or_else(|| Error::Serialization(format!("Expected hex quantity, got {}", value)))
        .and_then(parse_quantity)
}

#[async_trait]
impl LedgerClient for JsonRpcClient {
    fn chain_type(&self) -> &str {
        "evm"
    }

    async fn pending_nonce(&self, address: &str) -> Result<u64, Error> {
        as_quantity(self.call_required("eth_getTransactionCount", json!([address, "pending"])).await?)
    }

    async fn suggest_gas_price(&self) -> Result<u64, Error> {
        as_quantity(self.call_required("eth_gasPrice", json!([])).await?)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, Error> {
        let result = self
            .call_required("eth_sendRawTransaction", json!([format!("0x{}", hex::encode(raw_tx))]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Serialization(format!("Expected transaction hash, got {}", result)))
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, Error> {
        let Some(value) = self.call("eth_getTransactionReceipt", json!([tx_hash])).await? else {
            return Ok(None);
        };
        let entry: ReceiptEntry = serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        // receipts for pending blocks carry no block number yet
        let Some(block_number) = entry.block_number else {
            return Ok(None);
        };
        Ok(Some(TxReceipt {
            transaction_hash: entry.transaction_hash,
            block_number: parse_quantity(&block_number)?,
            success: entry.status.as_deref() == Some("0x1"),
        }))
    }

    async fn block_number(&self) -> Result<u64, Error> {
        as_quantity(self.call_required("eth_blockNumber", json!([])).await?)
    }
}

#[async_trait]
impl SourceLedger for JsonRpcClient {
    async fn head(&self) -> Result<u64, Error> {
        LedgerClient::block_number(self).await
    }

    async fn logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<RawLog>, Error> {
        let result = self
            .call_required(
                "eth_getLogs",
                json!([{
                    "address": address,
                    "fromBlock": format!("0x{:x}", from),
                    "toBlock": format!("0x{:x}", to)
                }]),
            )
            .await?;
        let entries: Vec<LogEntry> = serde_json::from_value(result).map_err(|e| Error::Serialization(e.to_string()))?;

        entries
            .into_iter()
            .map(|entry| {
                Ok(RawLog {
                    address: entry.address,
                    topics: entry.topics,
                    data: hex::decode(entry.data.trim_start_matches("0x"))
                        .map_err(|e| Error::Serialization(format!("Invalid log data: {}", e)))?,
                    block_number: parse_quantity(&entry.block_number)?,
                    transaction_hash: entry.transaction_hash,
                    log_index: parse_quantity(&entry.log_index)?,
                    timestamp: entry.block_timestamp.as_deref().map(parse_quantity).transpose()?,
                })
            })
            .collect()
    }
}
