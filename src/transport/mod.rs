//! Blob storage transport.
//!
//! The reconciliation engine only needs four operations from a backend,
//! captured by [`BlobStore`]. [`ObjectStoreBackend`] implements it on top
//! of any `object_store` store (S3, GCS, local filesystem, memory).

use crate::error::Result;
use crate::streaming::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;

pub mod cloud;

pub use cloud::{ObjectStoreBackend, DELETE_BATCH_SIZE, UPLOAD_PART_SIZE};

/// Per-object upload settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
}

/// Narrow capability surface of a blob backend.
///
/// Keys are encoded object keys (see [`crate::path::RemoteKey`]), the same
/// form [`BlobStore::list`] returns, so listed keys can be compared with and
/// passed back unchanged. Errors reading `body` during [`BlobStore::put`]
/// are returned as [`crate::error::SyncError::Io`] and nothing is committed;
/// every other failure is a [`crate::error::SyncError::Backend`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch an object; `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stream `body` into `key`. The object becomes visible only if the
    /// whole body was read.
    async fn put(&self, key: &str, body: ByteStream, opts: &PutOptions) -> Result<()>;

    /// Every key under `prefix`, across all listing pages.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete `keys`; deleting a missing key is not an error.
    async fn delete_batch(&self, keys: &[String]) -> Result<()>;
}
