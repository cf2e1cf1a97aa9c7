use std::sync::Arc;

use tracing::info;

use crate::config::VALUE_DECIMALS;
use crate::db::store::{NewDomainEvent, PurchaseRecord, PurchaseResult, SettleResult, Store};
use crate::error::{AppError, Result};
use crate::notify::{MarketUpdate, SettlementPublisher};
use crate::source::EventSource;
use crate::types::{
    from_fixed, ApplyOutcome, ChainEvent, EventKind, EventMeta, MarketCreated, MarketSettled,
    NormalizedEvent, SharesPurchased, SkipReason, TokensWithdrawn,
};

/// One idempotent handler per event kind. Handlers return `Result<ApplyOutcome>`;
/// `apply` turns errors into the uniform outcome so the caller decides what
/// happens next.
pub struct Applier {
    store: Store,
    source: Arc<dyn EventSource>,
    publisher: Arc<dyn SettlementPublisher>,
}

impl Applier {
    pub fn new(store: Store, source: Arc<dyn EventSource>, publisher: Arc<dyn SettlementPublisher>) -> Self {
        Self { store, source, publisher }
    }

    pub async fn apply(&self, ev: &NormalizedEvent) -> ApplyOutcome {
        let log_entry = NewDomainEvent::from_event(ev);
        let result = match &ev.event {
            ChainEvent::MarketCreated(e) => self.market_created(e, &log_entry).await,
            ChainEvent::SharesPurchased(e) => self.shares_purchased(&ev.meta, e).await,
            ChainEvent::MarketSettled(e) => match self.market_settled(e, &log_entry).await {
                // A settlement that cannot be written must not disappear quietly.
                Err(err) if err.is_store() => return ApplyOutcome::Fatal(err),
                other => other,
            },
            ChainEvent::TokensWithdrawn(e) => self.tokens_withdrawn(e, &log_entry).await,
        };
        result.unwrap_or_else(|err| ApplyOutcome::Skipped(SkipReason::from_error(&err)))
    }

    async fn market_created(&self, e: &MarketCreated, log_entry: &NewDomainEvent) -> Result<ApplyOutcome> {
        if !self.store.create_market(e, log_entry).await? {
            return Ok(ApplyOutcome::Skipped(SkipReason::AlreadyProcessed));
        }
        info!(
            market_id = e.market_id,
            creator = %e.creator,
            target_valuation = from_fixed(e.target_valuation, VALUE_DECIMALS),
            "Indexed DTF #{} created by {}",
            e.market_id,
            e.creator,
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn shares_purchased(&self, meta: &EventMeta, e: &SharesPurchased) -> Result<ApplyOutcome> {
        let tx = &meta.transaction_hash;
        if self.store.is_processed(EventKind::SharesPurchased, tx).await? {
            return Ok(ApplyOutcome::Skipped(SkipReason::AlreadyProcessed));
        }
        if self.store.market(e.market_id).await?.is_none() {
            return Ok(ApplyOutcome::Skipped(SkipReason::MarketNotFound(e.market_id)));
        }

        // Entry price is fixed by the purchase that opens the position, so the
        // price lookup is only needed when there is no position yet.
        let entry_price = match self.store.position(e.market_id, &e.buyer, e.side).await? {
            Some(existing) => existing.entry_price,
            None => {
                let price_block = meta.block_number.saturating_sub(1);
                let (yes, no) = self.source.share_prices(e.market_id, price_block).await?;
                let raw = if e.side.is_yes() { yes } else { no };
                i64::try_from(raw)
                    .map_err(|_| AppError::Decode(format!("share price {raw} out of range")))?
            }
        };

        let record = PurchaseRecord {
            market_id: e.market_id,
            buyer: e.buyer.clone(),
            side: e.side,
            share_amount: from_fixed(e.amount, VALUE_DECIMALS),
            entry_price,
            transaction_hash: tx.clone(),
            block_number: meta.block_number,
        };

        match self.store.record_purchase(&record).await? {
            PurchaseResult::AlreadyProcessed => Ok(ApplyOutcome::Skipped(SkipReason::AlreadyProcessed)),
            result => {
                info!(
                    market_id = e.market_id,
                    buyer = %e.buyer,
                    side = %e.side,
                    shares = record.share_amount,
                    entry_price = record.entry_price,
                    tx = %tx,
                    opened = result == PurchaseResult::Opened,
                    "Indexed purchase of {:.6} {} shares in DTF #{}",
                    record.share_amount,
                    e.side,
                    e.market_id,
                );
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    async fn market_settled(&self, e: &MarketSettled, log_entry: &NewDomainEvent) -> Result<ApplyOutcome> {
        match self.store.settle_market(e.market_id, e.yes_won, log_entry).await? {
            SettleResult::MarketNotFound => Ok(ApplyOutcome::Skipped(SkipReason::MarketNotFound(e.market_id))),
            SettleResult::AlreadySettled => Ok(ApplyOutcome::Skipped(SkipReason::AlreadySettled(e.market_id))),
            SettleResult::Settled => {
                info!(market_id = e.market_id, yes_won = e.yes_won, "Settled DTF #{}", e.market_id);
                self.publisher.publish(MarketUpdate::settled(e.market_id, e.yes_won));
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    async fn tokens_withdrawn(&self, e: &TokensWithdrawn, log_entry: &NewDomainEvent) -> Result<ApplyOutcome> {
        if self.store.market(e.market_id).await?.is_none() {
            return Ok(ApplyOutcome::Skipped(SkipReason::MarketNotFound(e.market_id)));
        }
        let claimed = self.store.mark_claimed(e.market_id, &e.withdrawer, log_entry).await?;
        info!(
            market_id = e.market_id,
            user = %e.withdrawer,
            claimed,
            "Indexed TokensWithdrawn for DTF #{} by user {}",
            e.market_id,
            e.withdrawer,
        );
        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::test_support;
    use crate::notify::BroadcastPublisher;
    use crate::source::mock::{MockSource, CREATOR};
    use crate::types::Side;

    const BUYER: &str = "0x000000000000000000000000000000000000000b";
    const E18: u128 = 1_000_000_000_000_000_000;

    struct Harness {
        store: Store,
        source: Arc<MockSource>,
        publisher: Arc<BroadcastPublisher>,
        applier: Applier,
    }

    async fn harness() -> Harness {
        let store = test_support::store().await;
        let source = Arc::new(MockSource::new(1_000));
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let applier = Applier::new(store.clone(), source.clone(), publisher.clone());
        Harness { store, source, publisher, applier }
    }

    fn meta(block: u64, tx: &str) -> EventMeta {
        EventMeta {
            block_number: block,
            transaction_hash: tx.to_string(),
            transaction_index: 0,
            log_index: 0,
        }
    }

    fn created(id: i64, block: u64, tx: &str) -> NormalizedEvent {
        NormalizedEvent {
            meta: meta(block, tx),
            event: ChainEvent::MarketCreated(test_support::market(id, CREATOR)),
        }
    }

    fn purchased(id: i64, side: Side, amount: u128, block: u64, tx: &str) -> NormalizedEvent {
        NormalizedEvent {
            meta: meta(block, tx),
            event: ChainEvent::SharesPurchased(SharesPurchased {
                market_id: id,
                side,
                amount,
                buyer: BUYER.to_string(),
            }),
        }
    }

    fn settled(id: i64, yes_won: bool, block: u64, tx: &str) -> NormalizedEvent {
        NormalizedEvent {
            meta: meta(block, tx),
            event: ChainEvent::MarketSettled(MarketSettled { market_id: id, yes_won }),
        }
    }

    fn withdrawn(id: i64, block: u64, tx: &str) -> NormalizedEvent {
        NormalizedEvent {
            meta: meta(block, tx),
            event: ChainEvent::TokensWithdrawn(TokensWithdrawn {
                market_id: id,
                withdrawer: BUYER.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn purchase_replay_leaves_shares_unchanged() {
        let h = harness().await;
        h.source.set_price(7, 9, 600_000, 400_000);
        assert!(h.applier.apply(&created(7, 1, "0xc1")).await.is_applied());

        let buy = purchased(7, Side::Yes, 10 * E18, 10, "0xp1");
        assert!(h.applier.apply(&buy).await.is_applied());
        let outcome = h.applier.apply(&buy).await;
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::AlreadyProcessed)));

        let pos = h.store.position(7, BUYER, Side::Yes).await.unwrap().unwrap();
        assert!((pos.share_amount - 10.0).abs() < 1e-9);
        assert_eq!(pos.entry_price, 600_000);
    }

    #[tokio::test]
    async fn second_purchase_adds_shares_but_keeps_first_price() {
        let h = harness().await;
        h.source.set_price(7, 9, 600_000, 400_000);
        h.source.set_price(7, 19, 900_000, 100_000);
        h.applier.apply(&created(7, 1, "0xc1")).await;

        assert!(h.applier.apply(&purchased(7, Side::Yes, 10 * E18, 10, "0xp1")).await.is_applied());
        assert!(h.applier.apply(&purchased(7, Side::Yes, 5 * E18, 20, "0xp2")).await.is_applied());

        let rows = h.store.positions_for_tuple(7, BUYER, true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].share_amount - 15.0).abs() < 1e-9);
        assert_eq!(rows[0].entry_price, 600_000);
        assert_eq!(h.source.price_calls(), vec![(7, 9)]);
    }

    #[tokio::test]
    async fn no_side_purchase_uses_no_price() {
        let h = harness().await;
        h.source.set_price(7, 9, 600_000, 400_000);
        h.applier.apply(&created(7, 1, "0xc1")).await;
        h.applier.apply(&purchased(7, Side::No, E18, 10, "0xp1")).await;
        let pos = h.store.position(7, BUYER, Side::No).await.unwrap().unwrap();
        assert_eq!(pos.entry_price, 400_000);
    }

    #[tokio::test]
    async fn purchase_with_price_lookup_failure_is_skipped_without_marker() {
        let h = harness().await;
        h.applier.apply(&created(7, 1, "0xc1")).await;

        let outcome = h.applier.apply(&purchased(7, Side::Yes, E18, 10, "0xp1")).await;
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::Source(_))), "got {outcome:?}");
        assert!(!h.store.is_processed(EventKind::SharesPurchased, "0xp1").await.unwrap());

        // Re-delivery after the node recovers applies normally.
        h.source.set_price(7, 9, 600_000, 400_000);
        assert!(h.applier.apply(&purchased(7, Side::Yes, E18, 10, "0xp1")).await.is_applied());
    }

    #[tokio::test]
    async fn purchase_for_unknown_market_is_skipped() {
        let h = harness().await;
        let outcome = h.applier.apply(&purchased(99, Side::Yes, E18, 10, "0xp1")).await;
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::MarketNotFound(99))));
    }

    #[tokio::test]
    async fn settlement_publishes_once_after_commit() {
        let h = harness().await;
        let mut updates = h.publisher.subscribe();
        h.applier.apply(&created(7, 1, "0xc1")).await;

        assert!(h.applier.apply(&settled(7, true, 30, "0xs1")).await.is_applied());
        let again = h.applier.apply(&settled(7, true, 31, "0xs2")).await;
        assert!(matches!(again, ApplyOutcome::Skipped(SkipReason::AlreadySettled(7))));

        assert_eq!(updates.try_recv().unwrap(), MarketUpdate::settled(7, true));
        assert!(updates.try_recv().is_err());

        let market = h.store.market(7).await.unwrap().unwrap();
        assert!(market.is_settled);
        assert_eq!(market.yes_won, Some(true));
    }

    #[tokio::test]
    async fn settlement_of_unknown_market_is_skipped() {
        let h = harness().await;
        let outcome = h.applier.apply(&settled(5, false, 30, "0xs1")).await;
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::MarketNotFound(5))));
    }

    #[tokio::test]
    async fn settlement_store_failure_is_fatal_and_not_published() {
        let h = harness().await;
        let mut updates = h.publisher.subscribe();
        h.applier.apply(&created(7, 1, "0xc1")).await;
        sqlx::query(
            "CREATE TRIGGER fail_log BEFORE INSERT ON domain_events BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(h.store.pool())
        .await
        .unwrap();

        let outcome = h.applier.apply(&settled(7, true, 30, "0xs1")).await;
        assert!(matches!(outcome, ApplyOutcome::Fatal(_)), "got {outcome:?}");
        assert!(!h.store.market(7).await.unwrap().unwrap().is_settled);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn withdrawal_claims_every_side() {
        let h = harness().await;
        h.source.set_price(7, 9, 600_000, 400_000);
        h.applier.apply(&created(7, 1, "0xc1")).await;
        h.applier.apply(&purchased(7, Side::Yes, E18, 10, "0xp1")).await;
        h.applier.apply(&purchased(7, Side::No, E18, 10, "0xp2")).await;

        assert!(h.applier.apply(&withdrawn(7, 40, "0xw1")).await.is_applied());
        assert!(h.applier.apply(&withdrawn(7, 40, "0xw1")).await.is_applied());

        for side in [Side::Yes, Side::No] {
            assert!(h.store.position(7, BUYER, side).await.unwrap().unwrap().claimed);
        }
    }

    #[tokio::test]
    async fn withdrawal_for_unknown_market_is_skipped() {
        let h = harness().await;
        let outcome = h.applier.apply(&withdrawn(3, 40, "0xw1")).await;
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::MarketNotFound(3))));
    }

    #[tokio::test]
    async fn market_redelivery_does_not_overwrite() {
        let h = harness().await;
        assert!(h.applier.apply(&created(7, 1, "0xc1")).await.is_applied());

        let mut changed = test_support::market(7, BUYER);
        changed.target_valuation = E18;
        let redelivered = NormalizedEvent {
            meta: meta(1, "0xc1"),
            event: ChainEvent::MarketCreated(changed),
        };
        assert!(matches!(
            h.applier.apply(&redelivered).await,
            ApplyOutcome::Skipped(SkipReason::AlreadyProcessed)
        ));

        let market = h.store.market(7).await.unwrap().unwrap();
        assert_eq!(market.creator_address, CREATOR);
        assert!((market.target_valuation - 100.0).abs() < 1e-9);
    }
}
