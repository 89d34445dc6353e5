//! Boundary to the node that signs and broadcasts transactions.
//!
//! The orchestrator never touches key material: deployment transactions
//! are handed to the node as `eth_sendTransaction` from an unlocked
//! account, and the node's signer turns them into broadcast
//! transactions. [`ChainClient`] is that capability as a trait, so the
//! submitter and orchestrator can be driven by test doubles;
//! [`EthClient`] is the JSON-RPC 2.0 implementation used in production.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::U256;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use url::Url;

use crate::{Address, H256};

#[derive(Debug, Clone)]
pub struct DeployTransaction {
    pub from: Address,
    /// Creation bytecode with the ABI-encoded constructor arguments
    /// appended.
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub contract_address: Option<Address>,
    pub succeeded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("transport error calling {method}: {reason}")]
    Transport { method: &'static str, reason: String },
    #[error("rpc error {code} calling {method}: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },
    #[error("malformed response for {method}: {reason}")]
    MalformedResponse { method: &'static str, reason: String },
}

impl ChainClientError {
    /// Transport failures (refused connections, timeouts) are worth
    /// retrying; an RPC-level rejection will repeat identically and is
    /// not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainClientError::Transport { .. })
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainClientError>;
    async fn get_nonce(&self, address: Address) -> Result<u64, ChainClientError>;
    async fn gas_price(&self) -> Result<U256, ChainClientError>;
    async fn send_deploy_transaction(
        &self,
        tx: &DeployTransaction,
    ) -> Result<H256, ChainClientError>;
    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainClientError>;
    async fn get_code(&self, address: Address) -> Result<Bytes, ChainClientError>;
}

/// JSON-RPC 2.0 client over HTTP with bounded transport retry.
pub struct EthClient {
    http: reqwest::Client,
    url: Url,
    max_number_of_retries: u64,
    backoff_factor: u64,
    min_retry_delay: Duration,
    max_retry_delay: Duration,
    request_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: H256,
    block_number: String,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    status: Option<String>,
}

impl EthClient {
    pub fn new(url: Url) -> Self {
        Self::new_with_config(url, 10, 2, Duration::from_millis(1000), Duration::from_secs(30))
    }

    pub fn new_with_config(
        url: Url,
        max_number_of_retries: u64,
        backoff_factor: u64,
        min_retry_delay: Duration,
        max_retry_delay: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            max_number_of_retries,
            backoff_factor,
            min_retry_delay,
            max_retry_delay,
            request_id: AtomicU64::new(1),
        }
    }

    fn retry_delay(&self, attempt: u64) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.min(16) as u32);
        self.min_retry_delay
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.max_retry_delay)
    }

    async fn request(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Value, ChainClientError> {
        let mut attempt = 0u64;
        loop {
            let body = json!({
                "jsonrpc": "2.0",
                "id": self.request_id.fetch_add(1, Ordering::Relaxed),
                "method": method,
                "params": params.clone(),
            });

            let outcome = self.http.post(self.url.clone()).json(&body).send().await;
            match outcome {
                Ok(response) => {
                    let parsed: RpcResponse = response.json().await.map_err(|err| {
                        ChainClientError::MalformedResponse {
                            method,
                            reason: err.to_string(),
                        }
                    })?;
                    if let Some(error) = parsed.error {
                        return Err(ChainClientError::Rpc {
                            method,
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return parsed
                        .result
                        .ok_or(ChainClientError::MalformedResponse {
                            method,
                            reason: "response carries neither result nor error".to_owned(),
                        });
                }
                Err(err) => {
                    if attempt >= self.max_number_of_retries {
                        return Err(ChainClientError::Transport {
                            method,
                            reason: err.to_string(),
                        });
                    }
                    let delay = self.retry_delay(attempt);
                    warn!(method, %err, attempt, ?delay, "rpc transport error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn quantity_u64(method: &'static str, value: &Value) -> Result<u64, ChainClientError> {
    let text = value
        .as_str()
        .ok_or_else(|| malformed(method, "expected a quantity string"))?;
    parse_hex_u64(text).map_err(|reason| malformed(method, &reason))
}

fn quantity_u256(method: &'static str, value: &Value) -> Result<U256, ChainClientError> {
    let text = value
        .as_str()
        .ok_or_else(|| malformed(method, "expected a quantity string"))?;
    parse_hex_u256(text).map_err(|reason| malformed(method, &reason))
}

fn malformed(method: &'static str, reason: &str) -> ChainClientError {
    ChainClientError::MalformedResponse {
        method,
        reason: reason.to_owned(),
    }
}

fn parse_hex_u64(text: &str) -> Result<u64, String> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|err| err.to_string())
}

fn parse_hex_u256(text: &str) -> Result<U256, String> {
    let digits = text.trim_start_matches("0x");
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{digits}");
        &padded
    } else {
        digits
    };
    let bytes = hex::decode(digits).map_err(|err| err.to_string())?;
    if bytes.len() > 32 {
        return Err("quantity wider than 256 bits".to_owned());
    }
    Ok(U256::from_big_endian(&bytes))
}

#[async_trait]
impl ChainClient for EthClient {
    async fn chain_id(&self) -> Result<u64, ChainClientError> {
        let result = self.request("eth_chainId", json!([])).await?;
        quantity_u64("eth_chainId", &result)
    }

    async fn get_nonce(&self, address: Address) -> Result<u64, ChainClientError> {
        let result = self
            .request(
                "eth_getTransactionCount",
                json!([format!("{address:#x}"), "pending"]),
            )
            .await?;
        quantity_u64("eth_getTransactionCount", &result)
    }

    async fn gas_price(&self) -> Result<U256, ChainClientError> {
        let result = self.request("eth_gasPrice", json!([])).await?;
        quantity_u256("eth_gasPrice", &result)
    }

    async fn send_deploy_transaction(
        &self,
        tx: &DeployTransaction,
    ) -> Result<H256, ChainClientError> {
        let mut object = serde_json::Map::new();
        object.insert("from".to_owned(), json!(format!("{:#x}", tx.from)));
        object.insert(
            "data".to_owned(),
            json!(format!("0x{}", hex::encode(&tx.data))),
        );
        object.insert("nonce".to_owned(), json!(format!("{:#x}", tx.nonce)));
        if let Some(gas_limit) = tx.gas_limit {
            object.insert("gas".to_owned(), json!(format!("{gas_limit:#x}")));
        }
        if let Some(gas_price) = tx.gas_price {
            object.insert("gasPrice".to_owned(), json!(format!("{gas_price:#x}")));
        }

        let result = self
            .request("eth_sendTransaction", json!([Value::Object(object)]))
            .await?;
        serde_json::from_value(result)
            .map_err(|err| malformed("eth_sendTransaction", &err.to_string()))
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainClientError> {
        let result = self
            .request(
                "eth_getTransactionReceipt",
                json!([format!("{tx_hash:#x}")]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let raw: RawReceipt = serde_json::from_value(result)
            .map_err(|err| malformed("eth_getTransactionReceipt", &err.to_string()))?;
        let block_number = parse_hex_u64(&raw.block_number)
            .map_err(|reason| malformed("eth_getTransactionReceipt", &reason))?;
        // Nodes without post-Byzantium receipts omit `status`; presence
        // of a created contract is then the only success signal.
        let succeeded = match raw.status.as_deref() {
            Some(status) => parse_hex_u64(status)
                .map_err(|reason| malformed("eth_getTransactionReceipt", &reason))?
                == 1,
            None => raw.contract_address.is_some(),
        };
        Ok(Some(TxReceipt {
            transaction_hash: raw.transaction_hash,
            block_number,
            contract_address: raw.contract_address,
            succeeded,
        }))
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, ChainClientError> {
        let result = self
            .request("eth_getCode", json!([format!("{address:#x}"), "latest"]))
            .await?;
        let text = result
            .as_str()
            .ok_or_else(|| malformed("eth_getCode", "expected a data string"))?;
        let bytes = hex::decode(text.trim_start_matches("0x"))
            .map_err(|err| malformed("eth_getCode", &err.to_string()))?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_quantities_parse_with_and_without_even_length() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u256("0x100").unwrap(), U256::from(256u64));
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let client = EthClient::new_with_config(
            Url::parse("http://localhost:8545").unwrap(),
            10,
            2,
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        assert_eq!(client.retry_delay(0), Duration::from_secs(1));
        assert_eq!(client.retry_delay(1), Duration::from_secs(2));
        assert_eq!(client.retry_delay(3), Duration::from_secs(8));
        assert_eq!(client.retry_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn receipt_without_status_falls_back_to_contract_address() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": format!("{:#x}", H256::repeat_byte(1)),
            "blockNumber": "0x10",
            "contractAddress": format!("{:#x}", Address::repeat_byte(2)),
        }))
        .unwrap();
        assert!(raw.status.is_none());
        assert_eq!(raw.contract_address, Some(Address::repeat_byte(2)));
    }

    #[test]
    fn transient_classification_only_covers_transport() {
        let transport = ChainClientError::Transport {
            method: "eth_gasPrice",
            reason: "connection refused".to_owned(),
        };
        let rpc = ChainClientError::Rpc {
            method: "eth_sendTransaction",
            code: -32000,
            message: "nonce too low".to_owned(),
        };
        assert!(transport.is_transient());
        assert!(!rpc.is_transient());
    }
}
