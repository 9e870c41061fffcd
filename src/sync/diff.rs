//! Diff engine: which sync units changed since their last committed upload.

use crate::error::{Result, SyncError};
use crate::path::{KeyNamer, RemoteKey};
use crate::state::MetadataStore;
use crate::sync::fingerprint::{fingerprint, Fingerprint, UnitDigest};
use crate::sync::partition::SyncUnit;
use futures::{StreamExt, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// A unit whose fingerprint differs from (or is missing in) the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectToUpload {
    pub unit: SyncUnit,
    pub key: RemoteKey,
    pub fingerprint: Fingerprint,
    /// Total bytes in the unit (before compression)
    pub size: u64,
}

/// Fingerprint every unit with at most `concurrency` in flight and return
/// the ones that need uploading, sorted by unit name.
///
/// Fingerprinting runs off the async runtime and outside the store lock;
/// only the comparison happens under the lock. The first failure aborts
/// the remaining work.
pub async fn changed_units(
    root: &Path,
    units: &[SyncUnit],
    namer: &KeyNamer,
    store: &Mutex<MetadataStore>,
    concurrency: usize,
) -> Result<Vec<ObjectToUpload>> {
    let mut changed: Vec<ObjectToUpload> = futures::stream::iter(units)
        .map(|unit| check_unit(root, unit, namer, store))
        .buffer_unordered(concurrency.max(1))
        .try_filter_map(|object| async move { Ok(object) })
        .try_collect()
        .await?;

    changed.sort_by(|a, b| a.unit.cmp(&b.unit));
    Ok(changed)
}

async fn check_unit(
    root: &Path,
    unit: &SyncUnit,
    namer: &KeyNamer,
    store: &Mutex<MetadataStore>,
) -> Result<Option<ObjectToUpload>> {
    let digest = compute_digest(unit, unit.local_path(root)).await?;
    let key = namer.key_for(unit.name());

    let store = store.lock().await;
    if store.is_current(key.as_str(), &digest.fingerprint) {
        debug!(unit = %unit, "Unchanged");
        return Ok(None);
    }
    debug!(unit = %unit, key = %key, "Changed");

    Ok(Some(ObjectToUpload {
        unit: unit.clone(),
        key,
        fingerprint: digest.fingerprint,
        size: digest.size,
    }))
}

async fn compute_digest(unit: &SyncUnit, path: PathBuf) -> Result<UnitDigest> {
    let name = unit.name().to_string();
    tokio::task::spawn_blocking(move || fingerprint(&path))
        .await
        .map_err(|e| SyncError::Hash {
            unit: name.clone(),
            source: io::Error::new(io::ErrorKind::Other, e.to_string()),
        })?
        .map_err(|source| SyncError::Hash { unit: name, source })
}
