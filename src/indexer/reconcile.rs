use tracing::info;

use crate::db::store::Store;
use crate::error::Result;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub groups: usize,
    pub deleted: u64,
}

/// Startup cleanup of positions written before purchases were idempotent.
///
/// For every (market, user, side) with more than one row, the earliest row is
/// kept as-is and the others are deleted. Deleted share amounts are *not*
/// folded into the survivor. Once no duplicates remain the uniqueness index
/// is installed so they cannot come back.
pub async fn reconcile_positions(store: &Store) -> Result<ReconcileStats> {
    info!("Starting duplicate position cleanup...");
    let groups = store.duplicate_position_groups().await?;
    info!("Found {} groups with duplicates", groups.len());

    let mut stats = ReconcileStats { groups: groups.len(), deleted: 0 };
    for group in &groups {
        let rows = store
            .positions_for_tuple(group.market_id, &group.user_address, group.is_yes)
            .await?;
        let Some((keep, remove)) = rows.split_first() else {
            continue;
        };
        if remove.is_empty() {
            continue;
        }

        let ids: Vec<i64> = remove.iter().map(|p| p.id).collect();
        info!(
            market_id = group.market_id,
            user = %group.user_address,
            is_yes = group.is_yes,
            rows = group.count,
            "Keeping position {} and removing {} duplicates for DTF {}",
            keep.id,
            ids.len(),
            group.market_id,
        );
        stats.deleted += store.delete_positions(&ids).await?;
    }

    store.ensure_position_uniqueness().await?;
    info!(groups = stats.groups, deleted = stats.deleted, "Duplicate cleanup complete");
    Ok(stats)
}
