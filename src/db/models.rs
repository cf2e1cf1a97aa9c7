/// Row types for the tables in `migrations/`.
use serde::Serialize;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRow {
    pub address: String,
    pub total_volume: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRow {
    pub id: i64,
    pub creator_address: String,
    pub name: String,
    pub expiry_time: i64,
    pub target_valuation: f64,
    pub is_target_higher: bool,
    pub yes_token_address: String,
    pub no_token_address: String,
    pub yes_pool: f64,
    pub no_pool: f64,
    pub distribution_pool: f64,
    pub is_settled: bool,
    pub yes_won: Option<bool>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRow {
    pub id: i64,
    pub user_address: String,
    pub market_id: i64,
    pub is_yes: bool,
    pub share_amount: f64,
    /// 6-decimal fixed point, price of the purchase that opened the row.
    pub entry_price: i64,
    pub claimed: bool,
    pub claimed_at: Option<i64>,
    pub transaction_hash: String,
    pub created_at: i64,
}

/// Position joined with the fields of its market the read API needs.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionWithMarketRow {
    pub id: i64,
    pub user_address: String,
    pub market_id: i64,
    pub market_name: String,
    pub is_yes: bool,
    pub share_amount: f64,
    pub entry_price: i64,
    pub claimed: bool,
    pub created_at: i64,
    pub is_settled: bool,
    pub yes_won: Option<bool>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEventRow {
    pub id: i64,
    pub market_id: i64,
    pub event_type: String,
    pub transaction_hash: String,
    pub block_number: i64,
    /// JSON text.
    pub data: String,
    pub created_at: i64,
}

/// One (market, user, side) tuple holding more than one position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DuplicateGroupRow {
    pub market_id: i64,
    pub user_address: String,
    pub is_yes: bool,
    pub count: i64,
}
