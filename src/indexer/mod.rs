pub mod applier;
pub mod normalizer;
pub mod reconcile;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::CHANNEL_CAPACITY;
use crate::db::store::Store;
use crate::error::Result;
use crate::notify::SettlementPublisher;
use crate::source::{EventSource, RawLog};
use crate::types::{ApplyOutcome, EventKind};

pub use applier::Applier;
pub use normalizer::Normalizer;
pub use reconcile::reconcile_positions;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PhaseStats {
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
    pub fatal: usize,
}

impl PhaseStats {
    fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Skipped(_) => self.skipped += 1,
            ApplyOutcome::Fatal(_) => self.fatal += 1,
        }
    }
}

/// Drives the three startup phases and then the live feed:
/// reconcile → backfill → live.
pub struct Indexer {
    store: Store,
    source: Arc<dyn EventSource>,
    normalizer: Normalizer,
    applier: Applier,
    lookback_blocks: u64,
}

impl Indexer {
    pub fn new(
        store: Store,
        source: Arc<dyn EventSource>,
        publisher: Arc<dyn SettlementPublisher>,
        lookback_blocks: u64,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(Arc::clone(&source)),
            applier: Applier::new(store.clone(), Arc::clone(&source), publisher),
            store,
            source,
            lookback_blocks,
        }
    }

    /// Runs for the process lifetime. Only reconciliation and subscription
    /// setup can fail; per-event problems are logged and skipped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("Starting event indexing...");
        reconcile_positions(&self.store).await?;

        match self.backfill().await {
            Ok(stats) => info!(
                fetched = stats.fetched,
                applied = stats.applied,
                skipped = stats.skipped,
                fatal = stats.fatal,
                "Historical backfill complete"
            ),
            Err(e) => error!("Error indexing historical events: {e}"),
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.source.subscribe(&EventKind::ALL, tx).await?;
        info!("Listening for live contract events");
        self.run_live(rx).await;
        Ok(())
    }

    /// Fetches every kind over the lookback window, orders the combined batch
    /// and applies it one event at a time. A kind whose query fails is left
    /// out; the others still run.
    pub async fn backfill(&self) -> Result<PhaseStats> {
        let head = self.source.block_number().await?;
        let from_block = head.saturating_sub(self.lookback_blocks);
        info!("Fetching historical events from block {from_block} to {head}");

        let mut batch = Vec::new();
        for kind in EventKind::ALL {
            match self.source.query_logs(kind, from_block, head).await {
                Ok(logs) => batch.extend(logs),
                Err(e) => error!(kind = %kind, "Error fetching historical {kind} logs: {e}"),
            }
        }
        sort_for_replay(&mut batch);

        let mut stats = PhaseStats { fetched: batch.len(), ..PhaseStats::default() };
        for log in batch {
            let outcome = self.process(log).await;
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Applies live logs as they arrive, each in its own task, until the
    /// channel closes. No reordering happens here; the store's statements
    /// serialize handlers that touch the same rows.
    pub async fn run_live(self: Arc<Self>, mut rx: mpsc::Receiver<RawLog>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                maybe_log = rx.recv() => match maybe_log {
                    Some(log) => {
                        let this = Arc::clone(&self);
                        tasks.spawn(async move { this.process(log).await });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Live event task failed: {e}");
                    }
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Live event task failed: {e}");
            }
        }
        warn!("Live event channel closed");
    }

    /// Normalize, apply, log. Never fails: the outcome says what happened.
    pub async fn process(&self, log: RawLog) -> ApplyOutcome {
        let tx = log.transaction_hash.clone().unwrap_or_default();
        let event = match self.normalizer.normalize(log).await {
            Ok(ev) => ev,
            Err(reason) => {
                warn!(tx = %tx, "Discarding log: {reason}");
                return ApplyOutcome::Skipped(reason);
            }
        };

        let outcome = self.applier.apply(&event).await;
        match &outcome {
            ApplyOutcome::Applied => debug!(kind = %event.kind(), tx = %tx, "applied"),
            ApplyOutcome::Skipped(reason) => {
                warn!(kind = %event.kind(), tx = %tx, market_id = event.event.market_id(), "Skipped {}: {reason}", event.kind())
            }
            ApplyOutcome::Fatal(e) => {
                error!(kind = %event.kind(), tx = %tx, market_id = event.event.market_id(), "Error processing {} event: {e}", event.kind())
            }
        }
        outcome
    }
}

/// Stable ascending sort by (block number, transaction index). Logs of the
/// same transaction keep their arrival order; log index is not consulted.
/// Logs missing either field sort last.
pub fn sort_for_replay(logs: &mut [RawLog]) {
    logs.sort_by_key(|l| {
        (
            l.block_number.unwrap_or(u64::MAX),
            l.transaction_index.unwrap_or(u64::MAX),
        )
    });
}
