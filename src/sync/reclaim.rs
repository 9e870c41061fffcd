//! Stale reclaim: delete remote objects under the prefix that no local unit maps to.

use crate::error::Result;
use crate::path::{KeyNamer, RemoteKey};
use crate::state::MetadataStore;
use crate::sync::partition::SyncUnit;
use crate::transport::BlobStore;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::info;

/// Delete every object under the destination prefix that no current unit
/// maps to.
///
/// The metadata store object is never a candidate. Returns the number of
/// stale objects (deleted, or that would be deleted in a dry run). Deleted
/// keys are pruned from `store`.
pub async fn reclaim(
    backend: &dyn BlobStore,
    namer: &KeyNamer,
    units: &[SyncUnit],
    store: &Mutex<MetadataStore>,
    metadata_key: &RemoteKey,
    dry_run: bool,
) -> Result<usize> {
    let expected: HashSet<String> = units
        .iter()
        .map(|unit| namer.key_for(unit.name()).into_string())
        .collect();

    let listed = backend.list(&namer.prefix()).await?;
    let stale: Vec<String> = listed
        .into_iter()
        .filter(|key| key != metadata_key.as_str() && !expected.contains(key))
        .collect();

    if stale.is_empty() {
        return Ok(0);
    }
    for key in &stale {
        info!(key = %key, "Deleting");
    }

    if !dry_run {
        backend.delete_batch(&stale).await?;
        let mut store = store.lock().await;
        for key in &stale {
            store.remove(key);
        }
        info!(count = stale.len(), "Deleted objects");
    }

    Ok(stale.len())
}
