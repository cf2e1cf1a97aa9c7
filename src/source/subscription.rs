use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{RECONNECT_BACKOFF_MS, WS_PING_INTERVAL_SECS};
use crate::error::{AppError, Result};
use crate::source::RawLog;

/// Keeps one `eth_subscribe("logs")` feed alive for the process lifetime and
/// forwards every notification to the indexer.
pub struct LogSubscription {
    ws_url: String,
    contract: String,
    topics: Vec<String>,
    tx: mpsc::Sender<RawLog>,
}

#[derive(Debug, Deserialize)]
struct Notification {
    method: Option<String>,
    params: Option<NotificationParams>,
    /// Present on the reply to our own `eth_subscribe` request.
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    result: RawLog,
}

#[derive(Debug, PartialEq)]
enum Frame {
    Log(RawLog),
    Subscribed(String),
    Rejected(String),
    Other,
}

impl LogSubscription {
    pub fn new(ws_url: String, contract: String, topics: Vec<String>, tx: mpsc::Sender<RawLog>) -> Self {
        Self { ws_url, contract, topics, tx }
    }

    pub async fn run(self) {
        let mut backoff_idx = 0usize;

        loop {
            info!("Subscription connecting to {}", self.ws_url);
            match self.connect_once().await {
                Ok(true) => {
                    info!("Indexer dropped the live channel, closing subscription");
                    return;
                }
                Ok(false) => {
                    info!("Subscription closed by node");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("Subscription error: {e}");
                }
            }

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .or(RECONNECT_BACKOFF_MS.last())
                .copied()
                .unwrap_or(1_000);
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len().saturating_sub(1));

            warn!("Subscription reconnecting in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Returns `Ok(true)` when the receiving side is gone and the feed should stop.
    async fn connect_once(&self) -> Result<bool> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(build_subscribe_msg(&self.contract, &self.topics).into()))
            .await?;

        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match parse_frame(&text) {
                                Frame::Log(log) => {
                                    debug!(tx = ?log.transaction_hash, block = ?log.block_number, "live log");
                                    if self.tx.send(log).await.is_err() {
                                        return Ok(true);
                                    }
                                }
                                Frame::Subscribed(id) => info!("Subscribed to contract logs (subscription {id})"),
                                Frame::Rejected(err) => {
                                    return Err(AppError::Rpc(format!("eth_subscribe rejected: {err}")));
                                }
                                Frame::Other => {}
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(false);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("Subscription ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }
            }
        }
    }
}

/// One filter, topic0 matching any of the configured event topics.
fn build_subscribe_msg(contract: &str, topics: &[String]) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["logs", { "address": contract, "topics": [topics] }],
    })
    .to_string()
}

/// At most `max_chars` characters of `text`, cut on a char boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(i, _)| &text[..i])
}

fn parse_frame(text: &str) -> Frame {
    let n: Notification = match serde_json::from_str(text) {
        Ok(n) => n,
        Err(e) => {
            warn!("Unrecognized subscription frame ({e}): {}", preview(text, 200));
            return Frame::Other;
        }
    };

    if let Some(err) = n.error {
        return Frame::Rejected(err.to_string());
    }
    if n.method.as_deref() == Some("eth_subscription") {
        if let Some(params) = n.params {
            return Frame::Log(params.result);
        }
    }
    match n.result {
        Some(serde_json::Value::String(id)) => Frame::Subscribed(id),
        _ => Frame::Other,
    }
}
