pub mod abi;
#[cfg(test)]
pub mod mock;
pub mod rpc;
pub mod subscription;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::EventKind;

pub use rpc::RpcSource;

/// A log as the node reports it. Live notifications can arrive before the
/// receipt is final, so the position fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default, deserialize_with = "quantity_opt")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default, deserialize_with = "quantity_opt")]
    pub transaction_index: Option<u64>,
    #[serde(default, deserialize_with = "quantity_opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub hash: String,
    pub from: String,
    #[serde(default, deserialize_with = "quantity_opt")]
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptInfo {
    pub transaction_hash: String,
    #[serde(default, deserialize_with = "quantity_opt")]
    pub block_number: Option<u64>,
    #[serde(default, deserialize_with = "quantity_opt")]
    pub transaction_index: Option<u64>,
}

/// Everything the indexer needs from a chain node. Every call may fail or
/// time out; callers treat a failure as the loss of one event, never as fatal.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Current chain head.
    async fn block_number(&self) -> Result<u64>;

    /// All logs of `kind` emitted by the contract in `[from_block, to_block]`.
    async fn query_logs(&self, kind: EventKind, from_block: u64, to_block: u64)
        -> Result<Vec<RawLog>>;

    /// `None` when the node does not know the transaction.
    async fn transaction(&self, hash: &str) -> Result<Option<TxInfo>>;

    /// `None` while the transaction is still pending.
    async fn transaction_receipt(&self, hash: &str) -> Result<Option<ReceiptInfo>>;

    /// Raw 6-decimal `(yes, no)` share prices of a market as of `block`.
    async fn share_prices(&self, market_id: i64, block: u64) -> Result<(u128, u128)>;

    /// Starts delivering new logs of `kinds` to `tx` for the rest of the
    /// process lifetime. Returns once the feed is set up.
    async fn subscribe(&self, kinds: &[EventKind], tx: mpsc::Sender<RawLog>) -> Result<()>;
}

/// Deserializes an optional JSON-RPC quantity (`"0x1a"`, or a plain number).
fn quantity_opt<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Hex(String),
        Num(u64),
    }

    match Option::<Quantity>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Quantity::Num(n)) => Ok(Some(n)),
        Some(Quantity::Hex(s)) => parse_quantity(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

pub fn parse_quantity(s: &str) -> std::result::Result<u64, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| format!("bad quantity {s:?}: {e}")),
        None => s.parse::<u64>().map_err(|e| format!("bad quantity {s:?}: {e}")),
    }
}
