//! Archive-and-upload phase.

use crate::error::{Result, SyncError};
use crate::state::MetadataStore;
use crate::streaming::{open_archive_stream, ARCHIVE_CONTENT_TYPE};
use crate::sync::diff::ObjectToUpload;
use crate::transport::{BlobStore, PutOptions};
use futures::TryStreamExt;
use indicatif::HumanBytes;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Settings shared by every upload of a run
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub storage_class: Option<String>,
    pub dry_run: bool,
    pub concurrency: usize,
}

/// Upload `objects` with at most `opts.concurrency` in flight.
///
/// Each unit is recorded in `store` right after its object is committed.
/// The first failure drops every in-flight upload and is returned; units
/// that had not committed yet are not recorded.
pub async fn upload_all(
    backend: &dyn BlobStore,
    root: &Path,
    objects: &[ObjectToUpload],
    store: &Mutex<MetadataStore>,
    opts: &UploadOptions,
) -> Result<()> {
    let put_opts = PutOptions {
        content_type: Some(ARCHIVE_CONTENT_TYPE.to_string()),
        storage_class: opts.storage_class.clone(),
    };

    futures::stream::iter(objects.iter().map(Ok::<_, SyncError>))
        .try_for_each_concurrent(opts.concurrency.max(1), |object| {
            let put_opts = &put_opts;
            async move {
                upload_one(backend, root, object, store, put_opts, opts.dry_run)
                    .await
                    .map_err(|e| e.in_unit(object.unit.name()))
            }
        })
        .await
}

async fn upload_one(
    backend: &dyn BlobStore,
    root: &Path,
    object: &ObjectToUpload,
    store: &Mutex<MetadataStore>,
    put_opts: &PutOptions,
    dry_run: bool,
) -> Result<()> {
    info!(unit = %object.unit, size = %HumanBytes(object.size), "Uploading");
    if dry_run {
        return Ok(());
    }

    let body = open_archive_stream(object.unit.local_path(root)).boxed();
    backend
        .put(object.key.as_str(), body, put_opts)
        .await
        .map_err(|e| match e {
            SyncError::Io(source) => SyncError::Archive {
                unit: object.unit.name().to_string(),
                source,
            },
            other => other,
        })?;

    store
        .lock()
        .await
        .record(object.key.as_str(), object.fingerprint.clone());
    debug!(unit = %object.unit, key = %object.key, "Committed");
    Ok(())
}
