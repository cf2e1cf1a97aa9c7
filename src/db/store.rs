use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use crate::config::VALUE_DECIMALS;
use crate::db::models::{
    DomainEventRow, DuplicateGroupRow, MarketRow, PositionRow, PositionWithMarketRow, UserRow,
};
use crate::error::Result;
use crate::types::{from_fixed, EventKind, MarketCreated, NormalizedEvent, Side};

/// Durable state. Every write the indexer makes goes through here, and the
/// statements here are the only serialization point between concurrently
/// applied live events.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// A row for the append-only event log.
#[derive(Debug, Clone)]
pub struct NewDomainEvent {
    pub market_id: i64,
    pub kind: EventKind,
    pub transaction_hash: String,
    pub block_number: u64,
    pub data: serde_json::Value,
}

impl NewDomainEvent {
    pub fn from_event(ev: &NormalizedEvent) -> Self {
        Self {
            market_id: ev.event.market_id(),
            kind: ev.kind(),
            transaction_hash: ev.meta.transaction_hash.clone(),
            block_number: ev.meta.block_number,
            data: ev.event.payload(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PurchaseRecord {
    pub market_id: i64,
    pub buyer: String,
    pub side: Side,
    pub share_amount: f64,
    /// Only used when the purchase opens a new position.
    pub entry_price: i64,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseResult {
    Opened,
    Increased,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleResult {
    Settled,
    AlreadySettled,
    MarketNotFound,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// How long a writer waits for the SQLite write lock held by another connection.
const BUSY_TIMEOUT_SECS: u64 = 10;

impl Store {
    /// Opens (creating if needed) the SQLite file and applies migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enforces one position per (market, user, side). Fails while legacy
    /// duplicates remain, so run it after the reconciliation pass.
    pub async fn ensure_position_uniqueness(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_positions_market_user_side
            ON positions (market_id, user_address, is_yes)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Indexer writes
    // -----------------------------------------------------------------------

    /// Creates the creator and the market if absent. Existing rows are never
    /// touched. Returns whether the market row was new; the log entry is
    /// appended only in that case.
    pub async fn create_market(&self, m: &MarketCreated, ev: &NewDomainEvent) -> Result<bool> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        upsert_user(&mut tx, &m.creator, now).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO markets (
                id, creator_address, name, expiry_time, target_valuation, is_target_higher,
                yes_token_address, no_token_address, yes_pool, no_pool, distribution_pool,
                is_settled, yes_won, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0, NULL, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(m.market_id)
        .bind(&m.creator)
        .bind(format!("DTF {}", m.market_id))
        .bind(now)
        .bind(from_fixed(m.target_valuation, VALUE_DECIMALS))
        .bind(m.is_target_higher)
        .bind(&m.yes_token)
        .bind(&m.no_token)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            append_event(&mut tx, ev, now).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Marker, buyer and position in one transaction. The marker insert comes
    /// first: if it conflicts, another delivery of the same transaction got
    /// there first and nothing is written.
    pub async fn record_purchase(&self, p: &PurchaseRecord) -> Result<PurchaseResult> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let fresh = sqlx::query(
            r#"
            INSERT INTO processed_events (event_type, transaction_hash, block_number, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(event_type, transaction_hash) DO NOTHING
            "#,
        )
        .bind(EventKind::SharesPurchased.as_str())
        .bind(&p.transaction_hash)
        .bind(p.block_number as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if !fresh {
            return Ok(PurchaseResult::AlreadyProcessed);
        }

        upsert_user(&mut tx, &p.buyer, now).await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM positions WHERE market_id = ? AND user_address = ? AND is_yes = ?",
        )
        .bind(p.market_id)
        .bind(&p.buyer)
        .bind(p.side.is_yes())
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                user_address, market_id, is_yes, share_amount, entry_price,
                claimed, claimed_at, transaction_hash, created_at
            ) VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?)
            ON CONFLICT(market_id, user_address, is_yes) DO UPDATE SET
                share_amount = positions.share_amount + excluded.share_amount
            "#,
        )
        .bind(&p.buyer)
        .bind(p.market_id)
        .bind(p.side.is_yes())
        .bind(p.share_amount)
        .bind(p.entry_price)
        .bind(&p.transaction_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(if existing.is_some() {
            PurchaseResult::Increased
        } else {
            PurchaseResult::Opened
        })
    }

    /// Flag and log entry commit together or not at all. The flag is only set
    /// if it is currently clear, so two racing deliveries settle once.
    pub async fn settle_market(
        &self,
        market_id: i64,
        yes_won: bool,
        ev: &NewDomainEvent,
    ) -> Result<SettleResult> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE markets SET is_settled = 1, yes_won = ? WHERE id = ? AND is_settled = 0",
        )
        .bind(yes_won)
        .bind(market_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM markets WHERE id = ?")
                .bind(market_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(match exists {
                Some(_) => SettleResult::AlreadySettled,
                None => SettleResult::MarketNotFound,
            });
        }

        append_event(&mut tx, ev, now).await?;
        tx.commit().await?;
        Ok(SettleResult::Settled)
    }

    /// Marks every position of `user` in `market_id` claimed and logs the
    /// withdrawal. Returns how many positions flipped; re-delivery flips none.
    pub async fn mark_claimed(&self, market_id: i64, user: &str, ev: &NewDomainEvent) -> Result<u64> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            r#"
            UPDATE positions SET claimed = 1, claimed_at = ?
            WHERE market_id = ? AND user_address = ? AND claimed = 0
            "#,
        )
        .bind(now)
        .bind(market_id)
        .bind(user)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        append_event(&mut tx, ev, now).await?;
        tx.commit().await?;
        Ok(flipped)
    }

    // -----------------------------------------------------------------------
    // Point lookups
    // -----------------------------------------------------------------------

    pub async fn market(&self, id: i64) -> Result<Option<MarketRow>> {
        Ok(sqlx::query_as::<_, MarketRow>("SELECT * FROM markets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn user(&self, address: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn is_processed(&self, kind: EventKind, transaction_hash: &str) -> Result<bool> {
        let hit: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM processed_events WHERE event_type = ? AND transaction_hash = ?",
        )
        .bind(kind.as_str())
        .bind(transaction_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }

    pub async fn position(&self, market_id: i64, user: &str, side: Side) -> Result<Option<PositionRow>> {
        Ok(sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT * FROM positions
            WHERE market_id = ? AND user_address = ? AND is_yes = ?
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(market_id)
        .bind(user)
        .bind(side.is_yes())
        .fetch_optional(&self.pool)
        .await?)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    pub async fn duplicate_position_groups(&self) -> Result<Vec<DuplicateGroupRow>> {
        Ok(sqlx::query_as::<_, DuplicateGroupRow>(
            r#"
            SELECT market_id, user_address, is_yes, COUNT(*) AS count
            FROM positions
            GROUP BY market_id, user_address, is_yes
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Oldest first.
    pub async fn positions_for_tuple(
        &self,
        market_id: i64,
        user: &str,
        is_yes: bool,
    ) -> Result<Vec<PositionRow>> {
        Ok(sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT * FROM positions
            WHERE market_id = ? AND user_address = ? AND is_yes = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(market_id)
        .bind(user)
        .bind(is_yes)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_positions(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for id in ids {
            deleted += sqlx::query("DELETE FROM positions WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub async fn list_markets(&self) -> Result<Vec<MarketRow>> {
        Ok(sqlx::query_as::<_, MarketRow>("SELECT * FROM markets ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn positions_by_market(&self, market_id: i64) -> Result<Vec<PositionRow>> {
        Ok(sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE market_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Newest market first, then newest position first.
    pub async fn positions_by_user(&self, user: &str) -> Result<Vec<PositionWithMarketRow>> {
        Ok(sqlx::query_as::<_, PositionWithMarketRow>(
            r#"
            SELECT p.id, p.user_address, p.market_id, m.name AS market_name, p.is_yes,
                   p.share_amount, p.entry_price, p.claimed, p.created_at,
                   m.is_settled, m.yes_won
            FROM positions p
            JOIN markets m ON m.id = p.market_id
            WHERE p.user_address = ?
            ORDER BY p.market_id DESC, p.created_at DESC, p.id DESC
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn events_for_market(&self, market_id: i64) -> Result<Vec<DomainEventRow>> {
        Ok(sqlx::query_as::<_, DomainEventRow>(
            "SELECT * FROM domain_events WHERE market_id = ? ORDER BY block_number ASC, id ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

async fn upsert_user(conn: &mut SqliteConnection, address: &str, now: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (address, total_volume, created_at) VALUES (?, 0, ?) ON CONFLICT(address) DO NOTHING",
    )
    .bind(address)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Appends to the event log unless this (market, kind, transaction) is
/// already recorded, so re-delivered logs do not duplicate entries.
async fn append_event(conn: &mut SqliteConnection, ev: &NewDomainEvent, now: i64) -> Result<()> {
    let data = serde_json::to_string(&ev.data)?;
    sqlx::query(
        r#"
        INSERT INTO domain_events (market_id, event_type, transaction_hash, block_number, data, created_at)
        SELECT ?, ?, ?, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM domain_events
            WHERE market_id = ? AND event_type = ? AND transaction_hash = ?
        )
        "#,
    )
    .bind(ev.market_id)
    .bind(ev.kind.as_str())
    .bind(&ev.transaction_hash)
    .bind(ev.block_number as i64)
    .bind(data)
    .bind(now)
    .bind(ev.market_id)
    .bind(ev.kind.as_str())
    .bind(&ev.transaction_hash)
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
