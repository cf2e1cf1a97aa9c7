//! Side-channel for settlement notifications. The indexer only knows the
//! `SettlementPublisher` trait; how updates reach clients is up to the
//! subscriber (the read API streams them as server-sent events).

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "dtfId")]
    pub market_id: i64,
    #[serde(rename = "yesWon")]
    pub yes_won: bool,
}

impl MarketUpdate {
    pub fn settled(market_id: i64, yes_won: bool) -> Self {
        Self { kind: "DTFSettled", market_id, yes_won }
    }
}

/// Called after a settlement has committed.
pub trait SettlementPublisher: Send + Sync {
    fn publish(&self, update: MarketUpdate);
}

/// Fan-out to any number of in-process subscribers.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<MarketUpdate>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketUpdate> {
        self.tx.subscribe()
    }
}

impl SettlementPublisher for BroadcastPublisher {
    fn publish(&self, update: MarketUpdate) {
        // No subscribers is not an error.
        let receivers = self.tx.send(update.clone()).unwrap_or(0);
        debug!(market_id = update.market_id, receivers, "published settlement");
    }
}
