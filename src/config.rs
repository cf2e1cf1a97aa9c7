use crate::error::{AppError, Result};

pub const RPC_URL: &str = "http://127.0.0.1:8545";

/// Backfill window: how many blocks behind the current head the historical
/// phase starts. Backfill never replays from genesis.
pub const DEFAULT_LOOKBACK_BLOCKS: u64 = 20_000;

/// Per-request timeout for JSON-RPC calls (seconds).
pub const RPC_TIMEOUT_SECS: u64 = 30;

/// Heartbeat ping interval on the subscription socket (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[250, 500, 1_000, 2_000, 5_000];

/// Channel capacity for live logs handed from the subscription to the indexer.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Buffered settlement notifications per subscriber before it starts lagging.
pub const BROADCAST_CAPACITY: usize = 256;

/// Fixed-point scales used by the market contract.
pub const VALUE_DECIMALS: u32 = 18;
pub const PRICE_DECIMALS: u32 = 6;

/// Creator fee charged on market volume, reported by the read API.
pub const CREATOR_FEE_RATE: f64 = 0.012;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    /// Websocket endpoint used for `eth_subscribe` (WS_RPC_URL, defaults to RPC_URL with a ws scheme)
    pub ws_rpc_url: String,
    /// Lower-cased 0x-prefixed address of the market contract (CONTRACT_ADDRESS)
    pub contract_address: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// LOOKBACK_BLOCKS
    pub lookback_blocks: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| RPC_URL.to_string());
        let ws_rpc_url = std::env::var("WS_RPC_URL").unwrap_or_else(|_| ws_url_for(&rpc_url));
        let contract_address = std::env::var("CONTRACT_ADDRESS")
            .map_err(|_| AppError::Config("CONTRACT_ADDRESS must be set".to_string()))?;

        Ok(Self {
            contract_address: parse_address(&contract_address)?,
            rpc_url,
            ws_rpc_url,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "dtf.db".to_string()),
            api_port: parse_or("API_PORT", std::env::var("API_PORT").ok(), 3001)?,
            lookback_blocks: parse_or(
                "LOOKBACK_BLOCKS",
                std::env::var("LOOKBACK_BLOCKS").ok(),
                DEFAULT_LOOKBACK_BLOCKS,
            )?,
        })
    }
}

/// Unset means `default`; set but unparsable is a config error.
fn parse_or<T: std::str::FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value: {v}"))),
    }
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`.
fn ws_url_for(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        rpc_url.to_string()
    }
}

fn parse_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::Config(format!(
            "CONTRACT_ADDRESS is not a 20-byte hex address: {raw}"
        )));
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}
