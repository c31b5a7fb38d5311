// ABOUTME: Full directory resync: walks every remote entity of a kind into the local cache.
// ABOUTME: Partial fetch failures keep what was merged and are reported, not raised.

use crate::directory::{fetch_all_snapshots, DirectoryItem};
use crate::entity::Entity;
use crate::error::FleetError;
use crate::store::EntityStateCache;
use crate::traits::RemoteDirectory;
use crate::utils::now_epoch_ms;
use futures_util::StreamExt;

#[derive(Debug, Default)]
pub struct SyncReport {
    /// Ids merged into the cache, in fetch order
    pub merged: Vec<String>,
    /// Per-entity failures (undecodable snapshot, local write error)
    pub errors: Vec<String>,
    /// Set when pagination stopped early
    pub fetch_error: Option<FleetError>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.fetch_error.is_none() && self.errors.is_empty()
    }
}

/// Merge every remote entity of `E`'s kind and stamp its sync time
pub async fn resync<E: Entity>(
    cache: &EntityStateCache<E>,
    directory: &dyn RemoteDirectory,
    page_size: u64,
) -> SyncReport {
    let mut report = SyncReport::default();
    let synced_at = now_epoch_ms();
    let mut snapshots = fetch_all_snapshots::<E>(directory, page_size);

    while let Some(item) = snapshots.next().await {
        match item {
            Ok(DirectoryItem::Snapshot(snapshot)) => {
                let id = E::snapshot_id(&snapshot).to_string();
                match cache.sync_from_remote(&snapshot, synced_at).await {
                    Ok(_) => report.merged.push(id),
                    Err(e) => {
                        tracing::warn!(kind = %E::KIND, entity = %id, error = %e, "Failed to merge entity");
                        report.errors.push(format!("{}: {}", id, e));
                    }
                }
            }
            Ok(DirectoryItem::Undecodable(e)) => {
                tracing::warn!(kind = %E::KIND, error = %e, "Skipping undecodable entity");
                report.errors.push(e.to_string());
            }
            Err(e) => report.fetch_error = Some(e),
        }
    }

    tracing::info!(
        kind = %E::KIND,
        merged = report.merged.len(),
        errors = report.errors.len(),
        partial = report.fetch_error.is_some(),
        "Directory resync finished"
    );
    report
}
