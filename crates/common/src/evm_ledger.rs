//! # EVM JSON-RPC Ledger Backend
//!
//! [`Ledger`] implementation that talks to an EVM node over JSON-RPC 2.0
//! (HTTP, `reqwest`).
//!
//! ## Calls
//!
//! | Operation | RPC method | Target |
//! |-----------|------------|--------|
//! | `balance_of` | `eth_call` | token contract |
//! | `is_sale_ended`, `sale_end_time` | `eth_call` | sale contract |
//! | `pool_balance` | `eth_call` | payout contract |
//! | `disburse` | `eth_sendTransaction` + `eth_getTransactionReceipt` | payout contract |
//! | `subscribe_transfers` | `eth_blockNumber` + `eth_getLogs` (polled) | token contract |
//!
//! ## Transaction Confirmation
//!
//! `disburse` submits from the node-managed operator account (signing and
//! nonce management stay with the node) and then polls for the receipt.
//! A receipt with status `0x1` is success; any other status is
//! [`LedgerError::Reverted`]. No receipt within the poll budget is
//! [`LedgerError::Timeout`]; the transaction may still land later, which is
//! why callers never retry a timed-out batch within the same cycle.
//!
//! ## No Implicit Retry
//!
//! Every method performs a single attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::abi;
use crate::address::Address;
use crate::config::LedgerConfig;
use crate::ledger::{Ledger, LedgerError, TransferEvent, TransferStream, TxReceipt};

// ════════════════════════════════════════════════════════════════════════════════
// JSON-RPC TYPES
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptResult {
    status: Option<String>,
    block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogResult {
    topics: Vec<String>,
    data: String,
}

// ════════════════════════════════════════════════════════════════════════════════
// RPC CLIENT
// ════════════════════════════════════════════════════════════════════════════════

/// Shared JSON-RPC transport; cloned into the transfer polling stream.
#[derive(Clone)]
struct RpcClient {
    client: reqwest::Client,
    url: String,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LedgerError::Timeout
                } else {
                    LedgerError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Network(format!("{} returned HTTP {}", method, status)));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("{} response: {}", method, e)))?;

        if let Some(err) = body.error {
            return Err(LedgerError::Rpc { code: err.code, message: err.message });
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }
}

/// Parses a hex quantity (`"0x1a"`) into `u64`.
fn parse_quantity(value: &Value) -> Result<u64, LedgerError> {
    let s = value
        .as_str()
        .ok_or_else(|| LedgerError::Decode(format!("expected hex quantity, got {}", value)))?;
    let body = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(body, 16)
        .map_err(|e| LedgerError::Decode(format!("invalid quantity '{}': {}", s, e)))
}

fn to_hex_data(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

// ════════════════════════════════════════════════════════════════════════════════
// EVM LEDGER
// ════════════════════════════════════════════════════════════════════════════════

/// JSON-RPC ledger backend for EVM chains.
pub struct EvmLedger {
    config: LedgerConfig,
    rpc: RpcClient,
    sel_balance_of: [u8; 4],
    sel_sale_ended: [u8; 4],
    sel_sale_end_time: [u8; 4],
    sel_pool_balance: [u8; 4],
    sel_disburse: [u8; 4],
    transfer_topic: [u8; 32],
}

impl std::fmt::Debug for EvmLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmLedger")
            .field("rpc_url", &self.config.rpc_url)
            .field("token", &self.config.token_address)
            .field("payout", &self.config.payout_address)
            .field("client", &"reqwest::Client")
            .finish()
    }
}

impl EvmLedger {
    /// Builds the backend. No request is made until the first call.
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        config
            .validate()
            .map_err(|e| LedgerError::InvalidRequest(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| LedgerError::Network(format!("failed to create HTTP client: {}", e)))?;

        let methods = &config.methods;
        Ok(Self {
            sel_balance_of: abi::selector(&methods.balance_of),
            sel_sale_ended: abi::selector(&methods.sale_ended),
            sel_sale_end_time: abi::selector(&methods.sale_end_time),
            sel_pool_balance: abi::selector(&methods.pool_balance),
            sel_disburse: abi::selector(&methods.disburse),
            transfer_topic: abi::event_topic(&methods.transfer_event),
            rpc: RpcClient {
                client,
                url: config.rpc_url.clone(),
                next_id: Arc::new(AtomicU64::new(1)),
            },
            config,
        })
    }

    /// Read-only `eth_call` returning the raw result bytes.
    async fn view(&self, to: &Address, calldata: Vec<u8>) -> Result<Vec<u8>, LedgerError> {
        let params = json!([
            { "to": to.to_hex(), "data": to_hex_data(&calldata) },
            "latest"
        ]);
        let value = self.rpc.call("eth_call", params).await?;
        let s = value
            .as_str()
            .ok_or_else(|| LedgerError::Decode(format!("eth_call returned {}", value)))?;
        abi::decode_hex(s)
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt, LedgerError> {
        let delay = Duration::from_millis(self.config.receipt_poll_ms);

        for attempt in 0..self.config.receipt_max_polls {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let value = self
                .rpc
                .call("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;
            if value.is_null() {
                continue;
            }

            let receipt: ReceiptResult = serde_json::from_value(value)
                .map_err(|e| LedgerError::Decode(format!("receipt: {}", e)))?;

            let block_number = match receipt.block_number {
                Some(ref b) => Some(parse_quantity(&Value::String(b.clone()))?),
                None => None,
            };

            return match receipt.status.as_deref() {
                Some("0x1") => Ok(TxReceipt { tx_hash: tx_hash.to_string(), block_number }),
                _ => Err(LedgerError::Reverted { tx_hash: tx_hash.to_string() }),
            };
        }

        warn!(tx_hash, polls = self.config.receipt_max_polls, "no receipt within poll budget");
        Err(LedgerError::Timeout)
    }
}

#[async_trait]
impl Ledger for EvmLedger {
    async fn balance_of(&self, address: &Address) -> Result<u128, LedgerError> {
        let data = abi::encode_call(self.sel_balance_of, &[abi::encode_address(address)]);
        let out = self.view(&self.config.token_address, data).await?;
        abi::decode_u128(&out)
    }

    async fn pool_balance(&self) -> Result<u128, LedgerError> {
        let data = abi::encode_call(self.sel_pool_balance, &[]);
        let out = self.view(&self.config.payout_address, data).await?;
        abi::decode_u128(&out)
    }

    async fn is_sale_ended(&self) -> Result<bool, LedgerError> {
        let data = abi::encode_call(self.sel_sale_ended, &[]);
        let out = self.view(&self.config.sale_address, data).await?;
        abi::decode_bool(&out)
    }

    async fn sale_end_time(&self) -> Result<u64, LedgerError> {
        let data = abi::encode_call(self.sel_sale_end_time, &[]);
        let out = self.view(&self.config.sale_address, data).await?;
        let value = abi::decode_u128(&out)?;
        u64::try_from(value)
            .map_err(|_| LedgerError::Decode(format!("end time {} exceeds u64", value)))
    }

    async fn disburse(
        &self,
        addresses: &[Address],
        amounts: &[u128],
    ) -> Result<TxReceipt, LedgerError> {
        let data = abi::encode_address_amount_arrays(self.sel_disburse, addresses, amounts)?;
        let params = json!([{
            "from": self.config.operator_address.to_hex(),
            "to": self.config.payout_address.to_hex(),
            "gas": format!("0x{:x}", self.config.gas_limit),
            "data": to_hex_data(&data),
        }]);

        let value = self.rpc.call("eth_sendTransaction", params).await?;
        let tx_hash = value
            .as_str()
            .ok_or_else(|| LedgerError::Decode(format!("eth_sendTransaction returned {}", value)))?
            .to_string();

        debug!(tx_hash = %tx_hash, recipients = addresses.len(), "disbursement submitted");
        self.wait_for_receipt(&tx_hash).await
    }

    fn subscribe_transfers(&self) -> TransferStream {
        let state = LogPoller {
            rpc: self.rpc.clone(),
            token: self.config.token_address,
            topic: self.transfer_topic,
            interval: Duration::from_millis(self.config.transfer_poll_ms),
            next_block: None,
            pending: std::collections::VecDeque::new(),
        };

        Box::pin(stream::unfold(state, |mut poller| async move {
            let item = poller.next().await;
            Some((item, poller))
        }))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TRANSFER LOG POLLER
// ════════════════════════════════════════════════════════════════════════════════

struct LogPoller {
    rpc: RpcClient,
    token: Address,
    topic: [u8; 32],
    interval: Duration,
    /// First block not yet scanned. `None` until the head is known.
    next_block: Option<u64>,
    pending: std::collections::VecDeque<TransferEvent>,
}

impl LogPoller {
    async fn next(&mut self) -> Result<TransferEvent, LedgerError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let head = match self.rpc.block_number().await {
                Ok(h) => h,
                Err(e) => {
                    tokio::time::sleep(self.interval).await;
                    return Err(e);
                }
            };

            let from = match self.next_block {
                Some(b) => b,
                None => {
                    // Only transfers after subscription time are reported.
                    self.next_block = Some(head + 1);
                    tokio::time::sleep(self.interval).await;
                    continue;
                }
            };

            if head < from {
                tokio::time::sleep(self.interval).await;
                continue;
            }

            let params = json!([{
                "address": self.token.to_hex(),
                "fromBlock": format!("0x{:x}", from),
                "toBlock": format!("0x{:x}", head),
                "topics": [to_hex_data(&self.topic)],
            }]);

            let value = match self.rpc.call("eth_getLogs", params).await {
                Ok(v) => v,
                Err(e) => {
                    tokio::time::sleep(self.interval).await;
                    return Err(e);
                }
            };

            // A malformed range is skipped rather than re-polled forever.
            self.next_block = Some(head + 1);
            let logs: Vec<LogResult> = match serde_json::from_value(value) {
                Ok(logs) => logs,
                Err(e) => {
                    tokio::time::sleep(self.interval).await;
                    return Err(LedgerError::Decode(format!("logs: {}", e)));
                }
            };

            for log in logs {
                match decode_transfer_log(&log) {
                    Ok(event) => self.pending.push_back(event),
                    Err(e) => warn!(error = %e, "skipping undecodable transfer log"),
                }
            }

            if self.pending.is_empty() {
                tokio::time::sleep(self.interval).await;
            }
        }
    }
}

fn decode_transfer_log(log: &LogResult) -> Result<TransferEvent, LedgerError> {
    if log.topics.len() < 3 {
        return Err(LedgerError::Decode(format!(
            "transfer log has {} topics, expected 3",
            log.topics.len()
        )));
    }
    let from = abi::decode_topic_address(&abi::decode_hex(&log.topics[1])?)?;
    let to = abi::decode_topic_address(&abi::decode_hex(&log.topics[2])?)?;
    let value = abi::decode_u128(&abi::decode_hex(&log.data)?)?;
    Ok(TransferEvent { from, to, value })
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn word_hex(value: u128) -> String {
        to_hex_data(&abi::encode_u128(value))
    }

    fn rpc_ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
    }

    fn test_config(url: &str) -> LedgerConfig {
        let mut c = LedgerConfig::new(
            url,
            Address([0x01; 20]),
            Address([0x02; 20]),
            Address([0x03; 20]),
            Address([0x04; 20]),
        );
        c.receipt_poll_ms = 1;
        c.receipt_max_polls = 3;
        c.transfer_poll_ms = 1;
        c
    }

    #[tokio::test]
    async fn balance_of_decodes_word() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_call" })))
            .respond_with(rpc_ok(json!(word_hex(1_500))))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        assert_eq!(ledger.balance_of(&Address([0x09; 20])).await.unwrap(), 1_500);
    }

    #[tokio::test]
    async fn sale_status_and_end_time() {
        let server = MockServer::start().await;
        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();

        let ended_data = to_hex_data(&abi::selector("preSaleEnded()"));
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "params": [{ "data": ended_data }] })))
            .respond_with(rpc_ok(json!(word_hex(1))))
            .mount(&server)
            .await;

        let end_data = to_hex_data(&abi::selector("preSaleEndTime()"));
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "params": [{ "data": end_data }] })))
            .respond_with(rpc_ok(json!(word_hex(1_700_000_000))))
            .mount(&server)
            .await;

        assert!(ledger.is_sale_ended().await.unwrap());
        assert_eq!(ledger.sale_end_time().await.unwrap(), 1_700_000_000);
    }

    #[tokio::test]
    async fn rpc_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": { "code": -32000, "message": "execution reverted" }
            })))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        let err = ledger.pool_balance().await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::Rpc { code: -32000, message: "execution reverted".to_string() }
        );
    }

    #[tokio::test]
    async fn http_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        assert!(matches!(ledger.pool_balance().await, Err(LedgerError::Network(_))));
    }

    #[tokio::test]
    async fn disburse_confirms_successful_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendTransaction" })))
            .respond_with(rpc_ok(json!("0xabc")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getTransactionReceipt" })))
            .respond_with(rpc_ok(json!({ "status": "0x1", "blockNumber": "0x10" })))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        let receipt = ledger.disburse(&[Address([0x05; 20])], &[10]).await.unwrap();
        assert_eq!(receipt.tx_hash, "0xabc");
        assert_eq!(receipt.block_number, Some(16));
    }

    #[tokio::test]
    async fn disburse_reverted_receipt_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendTransaction" })))
            .respond_with(rpc_ok(json!("0xdead")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getTransactionReceipt" })))
            .respond_with(rpc_ok(json!({ "status": "0x0", "blockNumber": "0x11" })))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        let err = ledger.disburse(&[Address([0x05; 20])], &[10]).await.unwrap_err();
        assert_eq!(err, LedgerError::Reverted { tx_hash: "0xdead".to_string() });
    }

    #[tokio::test]
    async fn disburse_without_receipt_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendTransaction" })))
            .respond_with(rpc_ok(json!("0xbeef")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getTransactionReceipt" })))
            .respond_with(rpc_ok(Value::Null))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        let err = ledger.disburse(&[Address([0x05; 20])], &[10]).await.unwrap_err();
        assert_eq!(err, LedgerError::Timeout);
    }

    #[tokio::test]
    async fn transfer_logs_are_streamed() {
        let server = MockServer::start().await;
        // Head at 0x10 on first poll, then 0x11.
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
            .respond_with(rpc_ok(json!("0x10")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
            .respond_with(rpc_ok(json!("0x11")))
            .mount(&server)
            .await;

        let from_topic = to_hex_data(&abi::encode_address(&Address([0xAA; 20])));
        let to_topic = to_hex_data(&abi::encode_address(&Address([0xBB; 20])));
        let topic0 = to_hex_data(&abi::event_topic("Transfer(address,address,uint256)"));
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getLogs" })))
            .respond_with(rpc_ok(json!([{
                "topics": [topic0, from_topic, to_topic],
                "data": word_hex(77),
            }])))
            .mount(&server)
            .await;

        let ledger = EvmLedger::new(test_config(&server.uri())).unwrap();
        let mut stream = ledger.subscribe_transfers();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            TransferEvent { from: Address([0xAA; 20]), to: Address([0xBB; 20]), value: 77 }
        );
    }

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), 26);
        assert!(parse_quantity(&json!(26)).is_err());
        assert!(parse_quantity(&json!("0xzz")).is_err());
    }
}
