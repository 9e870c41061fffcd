//! Reconciliation engine.
//!
//! One [`Reconciler::run`] brings the remote archive set of a single root
//! in line with the local tree:
//!
//! ```text
//! partition -> fingerprint + diff -> archive + upload -> reclaim
//!                 (bounded pool)       (bounded pool)
//!      load metadata store ^                  persist metadata store (always)
//! ```

pub mod diff;
pub mod fingerprint;
pub mod partition;
pub mod reclaim;
pub mod upload;

pub use diff::ObjectToUpload;
pub use fingerprint::{Fingerprint, UnitDigest};
pub use partition::{partition, SyncUnit};

use crate::config::DEFAULT_CONCURRENCY;
use crate::error::{Result, SyncError};
use crate::path::{object_key, KeyNamer, RemoteKey};
use crate::state::{MetadataStore, DEFAULT_METADATA_KEY};
use crate::transport::BlobStore;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use upload::UploadOptions;

/// Grace period for the final metadata save, independent of cancellation
pub const SAVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of one reconciliation run
#[derive(Debug, Clone)]
pub struct RunInput {
    /// Local directory to mirror
    pub root: PathBuf,
    /// Partition depth; 0 archives the whole root as one unit
    pub max_depth: usize,
    /// Destination prefix in the bucket
    pub prefix: String,
    pub storage_class: Option<String>,
    pub dry_run: bool,
    /// Units fingerprinted or uploaded at once
    pub concurrency: usize,
    /// Key of the metadata store object
    pub metadata_key: String,
}

impl RunInput {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            max_depth: 0,
            prefix: prefix.into(),
            storage_class: None,
            dry_run: false,
            concurrency: DEFAULT_CONCURRENCY,
            metadata_key: DEFAULT_METADATA_KEY.to_string(),
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunOutput {
    pub uploaded: usize,
    pub deleted: usize,
}

/// Drives one reconciliation run against a blob backend.
pub struct Reconciler {
    input: RunInput,
    backend: Arc<dyn BlobStore>,
    metadata_key: RemoteKey,
    store: Mutex<MetadataStore>,
}

impl Reconciler {
    pub fn new(input: RunInput, backend: Arc<dyn BlobStore>) -> Self {
        let metadata_key = object_key(&input.metadata_key);
        Self {
            input,
            backend,
            metadata_key,
            store: Mutex::new(MetadataStore::new()),
        }
    }

    /// Run the reconciliation.
    ///
    /// Once the metadata store has been loaded, it is saved again on every
    /// exit path of a non-dry run (success, failure or cancellation), on a
    /// fresh [`SAVE_TIMEOUT`] that `cancel` does not affect. A failed save
    /// is logged; the run's own result is returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunOutput> {
        let root = tokio::fs::canonicalize(&self.input.root)
            .await
            .map_err(|source| SyncError::Traversal {
                path: self.input.root.clone(),
                source,
            })?;
        // Name keys after the root as given, so a symlinked root keeps its name
        let named_root = if self.input.root.file_name().is_some() {
            self.input.root.as_path()
        } else {
            root.as_path()
        };
        let namer = KeyNamer::new(&self.input.prefix, named_root);

        let max_depth = self.input.max_depth;
        let walk_root = root.clone();
        let units = until_cancelled(&cancel, async {
            tokio::task::spawn_blocking(move || partition(&walk_root, max_depth))
                .await
                .map_err(|e| SyncError::Traversal {
                    path: root.clone(),
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })?
        })
        .await?;
        info!(count = units.len(), root = %root.display(), "Listed units");

        let loaded = until_cancelled(
            &cancel,
            MetadataStore::load(self.backend.as_ref(), self.metadata_key.as_str()),
        )
        .await?;
        *self.store.lock().await = loaded;

        let result = self.reconcile(&root, &namer, &units, &cancel).await;

        if !self.input.dry_run {
            self.persist().await;
        }

        match &result {
            Ok(output) => info!(
                uploaded = output.uploaded,
                deleted = output.deleted,
                dry_run = self.input.dry_run,
                "Run finished"
            ),
            Err(e) => error!(error = %e, "Run failed"),
        }
        result
    }

    async fn reconcile(
        &self,
        root: &Path,
        namer: &KeyNamer,
        units: &[SyncUnit],
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let concurrency = self.input.concurrency.max(1);

        let objects = until_cancelled(
            cancel,
            diff::changed_units(root, units, namer, &self.store, concurrency),
        )
        .await?;
        info!(count = objects.len(), "Listed units to upload");

        let opts = UploadOptions {
            storage_class: self.input.storage_class.clone(),
            dry_run: self.input.dry_run,
            concurrency,
        };
        until_cancelled(
            cancel,
            upload::upload_all(self.backend.as_ref(), root, &objects, &self.store, &opts),
        )
        .await?;

        let deleted = until_cancelled(
            cancel,
            reclaim::reclaim(
                self.backend.as_ref(),
                namer,
                units,
                &self.store,
                &self.metadata_key,
                self.input.dry_run,
            ),
        )
        .await?;

        Ok(RunOutput {
            uploaded: objects.len(),
            deleted,
        })
    }

    async fn persist(&self) {
        debug!(timeout = ?SAVE_TIMEOUT, "Saving metadata store");
        let store = self.store.lock().await.clone();
        let save = store.save(self.backend.as_ref(), self.metadata_key.as_str());
        match tokio::time::timeout(SAVE_TIMEOUT, save).await {
            Ok(Ok(())) => info!(count = store.len(), "Saved metadata store"),
            Ok(Err(e)) => error!(error = %e, "Failed to save metadata store"),
            Err(_) => error!(timeout = ?SAVE_TIMEOUT, "Timed out saving metadata store"),
        }
    }
}

/// Convenience wrapper: build a [`Reconciler`] and run it.
pub async fn run(
    input: RunInput,
    backend: Arc<dyn BlobStore>,
    cancel: CancellationToken,
) -> Result<RunOutput> {
    Reconciler::new(input, backend).run(cancel).await
}

/// Resolve `fut`, or fail with [`SyncError::Cancelled`] as soon as `cancel`
/// fires. The pending future is dropped, aborting its in-flight I/O.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}
