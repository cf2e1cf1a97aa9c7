use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::config::{CREATOR_FEE_RATE, PRICE_DECIMALS};
use crate::db::models::{DomainEventRow, MarketRow, PositionRow, PositionWithMarketRow, UserRow};
use crate::db::store::Store;
use crate::error::AppError;
use crate::notify::BroadcastPublisher;
use crate::types::{from_fixed, Side};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub updates: Arc<BroadcastPublisher>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/events", get(market_events_stream))
        .route("/api/v1/dtfs", get(get_markets))
        .route("/api/v1/dtfs/:id/fees", get(get_market_fees))
        .route("/api/v1/dtfs/:id/events", get(get_market_log))
        .route("/api/v1/users/:address", get(get_user))
        .route("/api/v1/positions/:address", get(get_positions))
        .route("/api/v1/positions/:address/details", get(get_position_details))
        .route("/api/v1/trades/:address", get(get_trades))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketResponse {
    #[serde(flatten)]
    pub market: MarketRow,
    pub positions: Vec<PositionRow>,
    pub events: Vec<DomainEventRow>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeesResponse {
    pub total_volume: f64,
    pub creator_fees: f64,
}

/// One position row formatted for display, prices as dollar strings.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionDetail {
    pub dtf_id: i64,
    pub dtf_name: String,
    pub position_type: Side,
    pub shares: f64,
    pub entry_price: String,
    pub total_cost: String,
    pub status: &'static str,
    pub claimed: bool,
    pub created_at: i64,
}

/// A user's holding in one side of one market.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeSummary {
    pub dtf_id: i64,
    pub dtf_name: String,
    pub position: Side,
    pub shares: f64,
    pub average_entry_price: f64,
    pub total_cost: f64,
    pub roi: f64,
    pub status: &'static str,
    pub claimed: bool,
    pub yes_won: Option<bool>,
    pub can_claim: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_markets(State(state): State<ApiState>) -> Result<Json<Vec<MarketResponse>>, AppError> {
    let markets = state.store.list_markets().await?;
    let mut out = Vec::with_capacity(markets.len());
    for market in markets {
        let positions = state.store.positions_by_market(market.id).await?;
        let events = state.store.events_for_market(market.id).await?;
        out.push(MarketResponse { market, positions, events });
    }
    Ok(Json(out))
}

async fn get_market_fees(
    State(state): State<ApiState>,
    Path(market_id): Path<i64>,
) -> Result<Json<FeesResponse>, AppError> {
    let positions = state.store.positions_by_market(market_id).await?;
    Ok(Json(market_fees(&positions)))
}

async fn get_market_log(
    State(state): State<ApiState>,
    Path(market_id): Path<i64>,
) -> Result<Json<Vec<DomainEventRow>>, AppError> {
    if state.store.market(market_id).await?.is_none() {
        return Err(AppError::NotFound(format!("DTF {market_id}")));
    }
    Ok(Json(state.store.events_for_market(market_id).await?))
}

async fn get_user(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<UserRow>, AppError> {
    let address = address.to_ascii_lowercase();
    state
        .store
        .user(&address)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("user {address}")))
}

async fn get_positions(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<PositionWithMarketRow>>, AppError> {
    Ok(Json(state.store.positions_by_user(&address.to_ascii_lowercase()).await?))
}

async fn get_position_details(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<PositionDetail>>, AppError> {
    let rows = state.store.positions_by_user(&address.to_ascii_lowercase()).await?;
    Ok(Json(position_details(rows)))
}

async fn get_trades(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<TradeSummary>>, AppError> {
    let rows = state.store.positions_by_user(&address.to_ascii_lowercase()).await?;
    Ok(Json(summarize_trades(&rows)))
}

/// Server-sent events, one per settlement committed by the indexer.
async fn market_events_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.updates.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(update) => match Event::default().json_data(&update) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => warn!("Failed to encode market update: {e}"),
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "SSE client lagging, dropped updates"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Derived figures
// ---------------------------------------------------------------------------

fn position_cost(entry_price: i64, shares: f64) -> f64 {
    from_fixed(entry_price.max(0) as u128, PRICE_DECIMALS) * shares
}

pub fn market_fees(positions: &[PositionRow]) -> FeesResponse {
    let total_volume: f64 = positions
        .iter()
        .map(|p| position_cost(p.entry_price, p.share_amount))
        .sum();
    FeesResponse {
        total_volume,
        creator_fees: total_volume * CREATOR_FEE_RATE,
    }
}

fn dollars(value: f64) -> String {
    format!("${value:.6}")
}

/// Newest first, one entry per stored row.
pub fn position_details(mut rows: Vec<PositionWithMarketRow>) -> Vec<PositionDetail> {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    rows.into_iter()
        .map(|p| PositionDetail {
            dtf_id: p.market_id,
            dtf_name: p.market_name,
            position_type: Side::from_is_yes(p.is_yes),
            shares: p.share_amount,
            entry_price: dollars(from_fixed(p.entry_price.max(0) as u128, PRICE_DECIMALS)),
            total_cost: dollars(position_cost(p.entry_price, p.share_amount)),
            status: if p.is_settled { "Settled" } else { "Active" },
            claimed: p.claimed,
            created_at: p.created_at,
        })
        .collect()
}

/// Groups rows by (market, side), preserving the order of first appearance.
/// ROI: shares pay out 1 each when the side wins or the market is still open,
/// so ROI is `shares - cost` then and `-cost` on a losing side.
pub fn summarize_trades(rows: &[PositionWithMarketRow]) -> Vec<TradeSummary> {
    let mut groups: Vec<(&PositionWithMarketRow, f64, f64)> = Vec::new();
    for row in rows {
        let cost = position_cost(row.entry_price, row.share_amount);
        match groups
            .iter_mut()
            .find(|(g, _, _)| g.market_id == row.market_id && g.is_yes == row.is_yes)
        {
            Some((_, shares, total)) => {
                *shares += row.share_amount;
                *total += cost;
            }
            None => groups.push((row, row.share_amount, cost)),
        }
    }

    groups
        .into_iter()
        .map(|(first, shares, total_cost)| {
            let won = first.yes_won.map(|yes_won| yes_won == first.is_yes);
            let roi = if first.is_settled && won != Some(true) {
                -total_cost
            } else {
                shares - total_cost
            };
            TradeSummary {
                dtf_id: first.market_id,
                dtf_name: first.market_name.clone(),
                position: Side::from_is_yes(first.is_yes),
                shares,
                average_entry_price: if shares > 0.0 { total_cost / shares } else { 0.0 },
                total_cost,
                roi,
                status: if first.is_settled { "Settled" } else { "Active" },
                claimed: first.claimed,
                yes_won: first.yes_won,
                can_claim: first.is_settled && !first.claimed,
            }
        })
        .collect()
}
