use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{Config, RPC_TIMEOUT_SECS};
use crate::error::{AppError, Result};
use crate::source::abi::{self, topic_for};
use crate::source::subscription::LogSubscription;
use crate::source::{parse_quantity, EventSource, RawLog, ReceiptInfo, TxInfo};
use crate::types::EventKind;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 client for one contract on one node. Logs, transactions and
/// the price view go over HTTP; the live feed goes over a websocket.
pub struct RpcSource {
    client: reqwest::Client,
    rpc_url: String,
    ws_url: String,
    contract: String,
    next_id: AtomicU64,
}

impl RpcSource {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            rpc_url: cfg.rpc_url.clone(),
            ws_url: cfg.ws_rpc_url.clone(),
            contract: cfg.contract_address.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_raw(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "rpc call");

        let resp: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(AppError::Rpc(format!("{method}: {} (code {})", err.message, err.code)));
        }
        Ok(resp.result)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.call_raw(method, params).await?;
        if result.is_null() {
            return Err(AppError::Rpc(format!("{method}: empty result")));
        }
        Ok(serde_json::from_value(result)?)
    }

    /// Like `call`, but a `null` result is a legitimate "not found".
    async fn call_opt<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let result = self.call_raw(method, params).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }
}

fn quantity(n: u64) -> String {
    format!("0x{n:x}")
}

#[async_trait]
impl EventSource for RpcSource {
    async fn block_number(&self) -> Result<u64> {
        let head: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&head).map_err(AppError::Rpc)
    }

    async fn query_logs(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        let filter = json!({
            "address": self.contract,
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
            "topics": [topic_for(kind)],
        });
        let logs: Vec<RawLog> = self.call("eth_getLogs", json!([filter])).await?;
        info!(kind = %kind, count = logs.len(), from_block, to_block, "fetched historical logs");
        Ok(logs)
    }

    async fn transaction(&self, hash: &str) -> Result<Option<TxInfo>> {
        self.call_opt("eth_getTransactionByHash", json!([hash])).await
    }

    async fn transaction_receipt(&self, hash: &str) -> Result<Option<ReceiptInfo>> {
        self.call_opt("eth_getTransactionReceipt", json!([hash])).await
    }

    async fn share_prices(&self, market_id: i64, block: u64) -> Result<(u128, u128)> {
        let call = json!({
            "to": self.contract,
            "data": abi::share_prices_calldata(market_id),
        });
        let ret: String = self.call("eth_call", json!([call, quantity(block)])).await?;
        abi::decode_share_prices(&ret)
    }

    async fn subscribe(&self, kinds: &[EventKind], tx: mpsc::Sender<RawLog>) -> Result<()> {
        let topics: Vec<String> = kinds.iter().map(|k| topic_for(*k).to_string()).collect();
        let subscription = LogSubscription::new(self.ws_url.clone(), self.contract.clone(), topics, tx);
        tokio::spawn(async move { subscription.run().await });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_are_minimal_hex() {
        assert_eq!(quantity(0), "0x0");
        assert_eq!(quantity(20_000), "0x4e20");
    }

    #[test]
    fn rpc_error_object_is_parsed() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();
        assert!(resp.result.is_null());
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "header not found");
    }
}
