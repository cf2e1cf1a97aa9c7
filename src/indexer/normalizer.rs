use std::sync::Arc;

use tracing::debug;

use crate::error::AppError;
use crate::source::abi::{self, Word};
use crate::source::{EventSource, RawLog};
use crate::types::{
    ChainEvent, EventKind, EventMeta, MarketCreated, MarketSettled, NormalizedEvent,
    SharesPurchased, Side, SkipReason, TokensWithdrawn,
};

/// Turns raw node logs into canonical events, filling in whatever the log
/// itself does not carry (sender account, block position of a live log).
pub struct Normalizer {
    source: Arc<dyn EventSource>,
}

impl Normalizer {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self { source }
    }

    pub async fn normalize(&self, log: RawLog) -> Result<NormalizedEvent, SkipReason> {
        if log.removed {
            return Err(SkipReason::Removed);
        }

        let kind = log
            .topics
            .first()
            .and_then(|t| abi::kind_for_topic(t))
            .ok_or_else(|| SkipReason::Decode(format!("unknown topic0 {:?}", log.topics.first())))?;

        let transaction_hash = log
            .transaction_hash
            .clone()
            .ok_or_else(|| SkipReason::Decode(format!("{kind} log without transaction hash")))?;

        let meta = self.resolve_meta(&log, transaction_hash).await?;
        let words = abi::log_words(&log.topics, &log.data).map_err(|e| SkipReason::from_error(&e))?;
        let event = self
            .decode(kind, &words, &meta.transaction_hash)
            .await?;

        debug!(kind = %kind, block = meta.block_number, tx = %meta.transaction_hash, "normalized");
        Ok(NormalizedEvent { meta, event })
    }

    /// Historical logs always carry their position; live ones may not yet,
    /// in which case the receipt supplies it.
    async fn resolve_meta(&self, log: &RawLog, transaction_hash: String) -> Result<EventMeta, SkipReason> {
        if let (Some(block_number), Some(transaction_index)) = (log.block_number, log.transaction_index) {
            return Ok(EventMeta {
                block_number,
                transaction_hash,
                transaction_index,
                log_index: log.log_index.unwrap_or(0),
            });
        }

        let receipt = self
            .source
            .transaction_receipt(&transaction_hash)
            .await
            .map_err(|e| SkipReason::from_error(&e))?
            .ok_or_else(|| SkipReason::BlockUnresolved(transaction_hash.clone()))?;
        let block_number = receipt
            .block_number
            .ok_or_else(|| SkipReason::BlockUnresolved(transaction_hash.clone()))?;

        Ok(EventMeta {
            block_number,
            transaction_index: log
                .transaction_index
                .or(receipt.transaction_index)
                .unwrap_or(0),
            log_index: log.log_index.unwrap_or(0),
            transaction_hash: receipt.transaction_hash,
        })
    }

    async fn decode(&self, kind: EventKind, words: &[Word], tx_hash: &str) -> Result<ChainEvent, SkipReason> {
        match kind {
            EventKind::MarketCreated => {
                let [id, creator, valuation, higher, yes, no] = take::<6>(kind, words)?;
                Ok(ChainEvent::MarketCreated(MarketCreated {
                    market_id: decode(abi::word_to_i64(id))?,
                    creator: decode(abi::word_to_address(creator))?,
                    target_valuation: decode(abi::word_to_u128(valuation))?,
                    is_target_higher: decode(abi::word_to_bool(higher))?,
                    yes_token: decode(abi::word_to_address(yes))?,
                    no_token: decode(abi::word_to_address(no))?,
                }))
            }
            EventKind::SharesPurchased => {
                let [id, is_yes, amount] = take::<3>(kind, words)?;
                let market_id = decode(abi::word_to_i64(id))?;
                let side = Side::from_is_yes(decode(abi::word_to_bool(is_yes))?);
                let amount = decode(abi::word_to_u128(amount))?;
                let buyer = self.sender(tx_hash).await?;
                Ok(ChainEvent::SharesPurchased(SharesPurchased { market_id, side, amount, buyer }))
            }
            EventKind::MarketSettled => {
                let [id, yes_won] = take::<2>(kind, words)?;
                Ok(ChainEvent::MarketSettled(MarketSettled {
                    market_id: decode(abi::word_to_i64(id))?,
                    yes_won: decode(abi::word_to_bool(yes_won))?,
                }))
            }
            EventKind::TokensWithdrawn => {
                let [id] = take::<1>(kind, words)?;
                let market_id = decode(abi::word_to_i64(id))?;
                let withdrawer = self.sender(tx_hash).await?;
                Ok(ChainEvent::TokensWithdrawn(TokensWithdrawn { market_id, withdrawer }))
            }
        }
    }

    /// The account that sent the transaction. Not recoverable from the log.
    async fn sender(&self, tx_hash: &str) -> Result<String, SkipReason> {
        match self.source.transaction(tx_hash).await {
            Ok(Some(tx)) if !tx.from.is_empty() => Ok(tx.from.to_ascii_lowercase()),
            Ok(_) => Err(SkipReason::AccountUnresolved(tx_hash.to_string())),
            Err(e) => Err(SkipReason::from_error(&e)),
        }
    }
}

/// The leading `N` argument words; trailing arguments are ignored.
fn take<const N: usize>(kind: EventKind, words: &[Word]) -> Result<[&Word; N], SkipReason> {
    if words.len() < N {
        return Err(SkipReason::Decode(format!(
            "{kind} log has {} argument words, expected at least {N}",
            words.len()
        )));
    }
    Ok(std::array::from_fn(|i| &words[i]))
}

fn decode<T>(r: Result<T, AppError>) -> Result<T, SkipReason> {
    r.map_err(|e| SkipReason::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::abi::{encode_words, uint_word, TOPIC_MARKET_SETTLED, TOPIC_SHARES_PURCHASED};
    use crate::source::mock::{self, MockSource};

    const BUYER: &str = "0x000000000000000000000000000000000000000b";

    fn normalizer(source: MockSource) -> Normalizer {
        Normalizer::new(Arc::new(source))
    }

    #[tokio::test]
    async fn market_created_decodes_all_fields() {
        let n = normalizer(MockSource::new(100));
        let log = mock::market_created(7, mock::CREATOR, 100 * 10u128.pow(18), 3, 1, "0xc1");
        let ev = n.normalize(log).await.unwrap();

        assert_eq!(ev.meta.block_number, 3);
        assert_eq!(ev.meta.transaction_index, 1);
        match ev.event {
            ChainEvent::MarketCreated(m) => {
                assert_eq!(m.market_id, 7);
                assert_eq!(m.creator, mock::CREATOR);
                assert_eq!(m.target_valuation, 100 * 10u128.pow(18));
                assert!(m.is_target_higher);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn purchase_resolves_buyer_from_transaction() {
        let source = MockSource::new(100);
        source.set_sender("0xp1", "0x000000000000000000000000000000000000000B");
        let n = normalizer(source);

        let ev = n
            .normalize(mock::shares_purchased(7, true, 10 * 10u128.pow(18), 5, 0, "0xp1"))
            .await
            .unwrap();
        match ev.event {
            ChainEvent::SharesPurchased(p) => {
                assert_eq!(p.buyer, BUYER);
                assert_eq!(p.side, Side::Yes);
                assert_eq!(p.amount, 10 * 10u128.pow(18));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn purchase_without_known_sender_is_discarded() {
        let n = normalizer(MockSource::new(100));
        let err = n
            .normalize(mock::shares_purchased(7, true, 1, 5, 0, "0xmissing"))
            .await
            .unwrap_err();
        assert_eq!(err, SkipReason::AccountUnresolved("0xmissing".to_string()));
    }

    #[tokio::test]
    async fn sender_lookup_failure_is_a_source_skip() {
        let source = MockSource::new(100);
        source.fail_transactions();
        let err = normalizer(source)
            .normalize(mock::tokens_withdrawn(7, 5, 0, "0xw1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SkipReason::Source(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn indexed_market_id_is_read_from_topics() {
        let source = MockSource::new(100);
        source.set_sender("0xp1", BUYER);
        let log = RawLog {
            topics: vec![TOPIC_SHARES_PURCHASED.to_string(), encode_words(&[uint_word(42)])],
            data: encode_words(&[abi::bool_word(false), uint_word(5)]),
            block_number: Some(9),
            transaction_index: Some(0),
            transaction_hash: Some("0xp1".to_string()),
            ..RawLog::default()
        };
        let ev = normalizer(source).normalize(log).await.unwrap();
        assert_eq!(ev.event.market_id(), 42);
        assert!(matches!(ev.event, ChainEvent::SharesPurchased(SharesPurchased { side: Side::No, .. })));
    }

    #[tokio::test]
    async fn live_log_without_block_uses_receipt() {
        let source = MockSource::new(100);
        source.set_receipt("0xs1", 77, 4);
        let mut log = mock::market_settled(7, true, 0, 0, "0xs1");
        log.block_number = None;
        log.transaction_index = None;

        let ev = normalizer(source).normalize(log).await.unwrap();
        assert_eq!(ev.meta.block_number, 77);
        assert_eq!(ev.meta.transaction_index, 4);
    }

    #[tokio::test]
    async fn pending_receipt_is_a_skip() {
        let mut log = mock::market_settled(7, true, 0, 0, "0xs1");
        log.block_number = None;
        let err = normalizer(MockSource::new(100)).normalize(log).await.unwrap_err();
        assert_eq!(err, SkipReason::BlockUnresolved("0xs1".to_string()));
    }

    #[tokio::test]
    async fn malformed_logs_are_decode_skips() {
        let n = normalizer(MockSource::new(100));

        let short = RawLog {
            topics: vec![TOPIC_MARKET_SETTLED.to_string()],
            data: encode_words(&[uint_word(7)]),
            block_number: Some(1),
            transaction_index: Some(0),
            transaction_hash: Some("0xs1".to_string()),
            ..RawLog::default()
        };
        assert!(matches!(n.normalize(short).await, Err(SkipReason::Decode(_))));

        let unknown = RawLog {
            topics: vec!["0x01".to_string()],
            transaction_hash: Some("0xs1".to_string()),
            ..RawLog::default()
        };
        assert!(matches!(n.normalize(unknown).await, Err(SkipReason::Decode(_))));

        let mut removed = mock::market_settled(7, true, 1, 0, "0xs1");
        removed.removed = true;
        assert_eq!(n.normalize(removed).await.unwrap_err(), SkipReason::Removed);
    }
}
