use serde::Serialize;
use serde_json::json;

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Event kinds and sides
// ---------------------------------------------------------------------------

/// The four contract events the indexer mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    MarketCreated,
    SharesPurchased,
    MarketSettled,
    TokensWithdrawn,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::MarketCreated,
        EventKind::SharesPurchased,
        EventKind::MarketSettled,
        EventKind::TokensWithdrawn,
    ];

    /// Name stored in `domain_events.event_type` / `processed_events.event_type`.
    /// Matches the contract's own event names.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MarketCreated => "DTFCreated",
            EventKind::SharesPurchased => "SharesPurchased",
            EventKind::MarketSettled => "DTFSettled",
            EventKind::TokensWithdrawn => "TokensWithdrawn",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn from_is_yes(is_yes: bool) -> Self {
        if is_yes {
            Side::Yes
        } else {
            Side::No
        }
    }

    pub fn is_yes(&self) -> bool {
        matches!(self, Side::Yes)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed point
// ---------------------------------------------------------------------------

/// Converts an on-chain fixed-point integer to a real number.
pub fn from_fixed(raw: u128, decimals: u32) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

// ---------------------------------------------------------------------------
// Canonical events, produced by the normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MarketCreated {
    pub market_id: i64,
    pub creator: String,
    /// 18-decimal fixed point.
    pub target_valuation: u128,
    pub is_target_higher: bool,
    pub yes_token: String,
    pub no_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SharesPurchased {
    pub market_id: i64,
    pub side: Side,
    /// 18-decimal fixed point.
    pub amount: u128,
    /// `from` of the emitting transaction.
    pub buyer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketSettled {
    pub market_id: i64,
    pub yes_won: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokensWithdrawn {
    pub market_id: i64,
    /// `from` of the emitting transaction.
    pub withdrawer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    MarketCreated(MarketCreated),
    SharesPurchased(SharesPurchased),
    MarketSettled(MarketSettled),
    TokensWithdrawn(TokensWithdrawn),
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::MarketCreated(_) => EventKind::MarketCreated,
            ChainEvent::SharesPurchased(_) => EventKind::SharesPurchased,
            ChainEvent::MarketSettled(_) => EventKind::MarketSettled,
            ChainEvent::TokensWithdrawn(_) => EventKind::TokensWithdrawn,
        }
    }

    pub fn market_id(&self) -> i64 {
        match self {
            ChainEvent::MarketCreated(e) => e.market_id,
            ChainEvent::SharesPurchased(e) => e.market_id,
            ChainEvent::MarketSettled(e) => e.market_id,
            ChainEvent::TokensWithdrawn(e) => e.market_id,
        }
    }

    /// Audit payload stored in `domain_events.data`.
    pub fn payload(&self) -> serde_json::Value {
        use crate::config::VALUE_DECIMALS;
        match self {
            ChainEvent::MarketCreated(e) => json!({
                "dtfId": e.market_id,
                "creator": e.creator,
                "targetValuation": from_fixed(e.target_valuation, VALUE_DECIMALS),
                "isTargetHigher": e.is_target_higher,
                "yesToken": e.yes_token,
                "noToken": e.no_token,
            }),
            ChainEvent::SharesPurchased(e) => json!({
                "dtfId": e.market_id,
                "isYesToken": e.side.is_yes(),
                "amount": from_fixed(e.amount, VALUE_DECIMALS),
                "buyer": e.buyer,
            }),
            ChainEvent::MarketSettled(e) => json!({
                "dtfId": e.market_id,
                "yesWon": e.yes_won,
            }),
            ChainEvent::TokensWithdrawn(e) => json!({
                "dtfId": e.market_id,
                "userAddress": e.withdrawer,
            }),
        }
    }
}

/// Where an event sits on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub meta: EventMeta,
    pub event: ChainEvent,
}

impl NormalizedEvent {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

// ---------------------------------------------------------------------------
// Handler outcomes
// ---------------------------------------------------------------------------

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    AlreadyProcessed,
    MarketNotFound(i64),
    AlreadySettled(i64),
    /// Reorged out by the node (`removed: true`).
    Removed,
    AccountUnresolved(String),
    BlockUnresolved(String),
    Source(String),
    Decode(String),
    Store(String),
}

impl SkipReason {
    pub fn from_error(e: &AppError) -> Self {
        if e.is_store() {
            SkipReason::Store(e.to_string())
        } else if e.is_source() {
            SkipReason::Source(e.to_string())
        } else {
            SkipReason::Decode(e.to_string())
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyProcessed => write!(f, "already processed"),
            SkipReason::MarketNotFound(id) => write!(f, "market {id} not found"),
            SkipReason::AlreadySettled(id) => write!(f, "market {id} already settled"),
            SkipReason::Removed => write!(f, "log removed by reorg"),
            SkipReason::AccountUnresolved(tx) => write!(f, "could not resolve sender of {tx}"),
            SkipReason::BlockUnresolved(tx) => write!(f, "no receipt yet for {tx}"),
            SkipReason::Source(e) => write!(f, "source error: {e}"),
            SkipReason::Decode(e) => write!(f, "decode error: {e}"),
            SkipReason::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

/// Uniform result of applying one event. The indexer decides what to do with
/// it; handlers never swallow errors themselves.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
    Fatal(AppError),
}

impl ApplyOutcome {
    #[cfg(test)]
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}
