//! Scripted in-process `EventSource` for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::source::abi::{self, address_word, bool_word, encode_words, topic_for, uint_word};
use crate::source::{EventSource, RawLog, ReceiptInfo, TxInfo};
use crate::types::EventKind;

pub const CREATOR: &str = "0x000000000000000000000000000000000000000a";
pub const CONTRACT: &str = "0x00000000000000000000000000000000000000cc";

#[derive(Default)]
struct Script {
    logs: Vec<RawLog>,
    senders: HashMap<String, String>,
    receipts: HashMap<String, ReceiptInfo>,
    prices: HashMap<(i64, u64), (u128, u128)>,
    price_calls: Vec<(i64, u64)>,
    failing_kinds: Vec<EventKind>,
    fail_transactions: bool,
    subscriber: Option<mpsc::Sender<RawLog>>,
}

pub struct MockSource {
    head: u64,
    script: Mutex<Script>,
}

impl MockSource {
    pub fn new(head: u64) -> Self {
        Self { head, script: Mutex::new(Script::default()) }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("mock script lock")
    }

    pub fn push_log(&self, log: RawLog) {
        self.script().logs.push(log);
    }

    pub fn set_sender(&self, tx_hash: &str, from: &str) {
        self.script().senders.insert(tx_hash.to_string(), from.to_string());
    }

    pub fn set_receipt(&self, tx_hash: &str, block: u64, tx_index: u64) {
        self.script().receipts.insert(
            tx_hash.to_string(),
            ReceiptInfo {
                transaction_hash: tx_hash.to_string(),
                block_number: Some(block),
                transaction_index: Some(tx_index),
            },
        );
    }

    pub fn set_price(&self, market_id: i64, block: u64, yes: u128, no: u128) {
        self.script().prices.insert((market_id, block), (yes, no));
    }

    pub fn price_calls(&self) -> Vec<(i64, u64)> {
        self.script().price_calls.clone()
    }

    pub fn fail_kind(&self, kind: EventKind) {
        self.script().failing_kinds.push(kind);
    }

    pub fn fail_transactions(&self) {
        self.script().fail_transactions = true;
    }

    pub fn subscriber(&self) -> Option<mpsc::Sender<RawLog>> {
        self.script().subscriber.clone()
    }
}

#[async_trait]
impl EventSource for MockSource {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.head)
    }

    async fn query_logs(&self, kind: EventKind, from_block: u64, to_block: u64) -> Result<Vec<RawLog>> {
        let script = self.script();
        if script.failing_kinds.contains(&kind) {
            return Err(AppError::Rpc(format!("eth_getLogs {kind}: timeout")));
        }
        Ok(script
            .logs
            .iter()
            .filter(|l| l.topics.first().and_then(|t| abi::kind_for_topic(t)) == Some(kind))
            .filter(|l| l.block_number.map_or(false, |b| b >= from_block && b <= to_block))
            .cloned()
            .collect())
    }

    async fn transaction(&self, hash: &str) -> Result<Option<TxInfo>> {
        let script = self.script();
        if script.fail_transactions {
            return Err(AppError::Rpc("eth_getTransactionByHash: timeout".to_string()));
        }
        Ok(script.senders.get(hash).map(|from| TxInfo {
            hash: hash.to_string(),
            from: from.clone(),
            block_number: None,
        }))
    }

    async fn transaction_receipt(&self, hash: &str) -> Result<Option<ReceiptInfo>> {
        Ok(self.script().receipts.get(hash).cloned())
    }

    async fn share_prices(&self, market_id: i64, block: u64) -> Result<(u128, u128)> {
        let mut script = self.script();
        script.price_calls.push((market_id, block));
        script
            .prices
            .get(&(market_id, block))
            .copied()
            .ok_or_else(|| AppError::Rpc(format!("eth_call: no price for {market_id}@{block}")))
    }

    async fn subscribe(&self, _kinds: &[EventKind], tx: mpsc::Sender<RawLog>) -> Result<()> {
        self.script().subscriber = Some(tx);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log builders
// ---------------------------------------------------------------------------

fn log(kind: EventKind, words: &[abi::Word], block: u64, tx_index: u64, tx_hash: &str) -> RawLog {
    RawLog {
        address: CONTRACT.to_string(),
        topics: vec![topic_for(kind).to_string()],
        data: encode_words(words),
        block_number: Some(block),
        transaction_hash: Some(tx_hash.to_string()),
        transaction_index: Some(tx_index),
        log_index: Some(0),
        removed: false,
    }
}

pub fn market_created(id: i64, creator: &str, valuation: u128, block: u64, tx_index: u64, tx_hash: &str) -> RawLog {
    let words = [
        uint_word(id as u128),
        address_word(creator).expect("creator address"),
        uint_word(valuation),
        bool_word(true),
        address_word("0x00000000000000000000000000000000000000a1").expect("yes token"),
        address_word("0x00000000000000000000000000000000000000a2").expect("no token"),
    ];
    log(EventKind::MarketCreated, &words, block, tx_index, tx_hash)
}

pub fn shares_purchased(id: i64, is_yes: bool, amount: u128, block: u64, tx_index: u64, tx_hash: &str) -> RawLog {
    let words = [uint_word(id as u128), bool_word(is_yes), uint_word(amount)];
    log(EventKind::SharesPurchased, &words, block, tx_index, tx_hash)
}

pub fn market_settled(id: i64, yes_won: bool, block: u64, tx_index: u64, tx_hash: &str) -> RawLog {
    let words = [uint_word(id as u128), bool_word(yes_won)];
    log(EventKind::MarketSettled, &words, block, tx_index, tx_hash)
}

pub fn tokens_withdrawn(id: i64, block: u64, tx_index: u64, tx_hash: &str) -> RawLog {
    let words = [
        uint_word(id as u128),
        address_word(CREATOR).expect("withdrawer"),
        uint_word(1),
    ];
    log(EventKind::TokensWithdrawn, &words, block, tx_index, tx_hash)
}
