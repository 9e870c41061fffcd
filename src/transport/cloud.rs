//! `object_store` backed [`BlobStore`].

use crate::config::{BackendKind, StorageConfig};
use crate::error::{Result, SyncError};
use crate::streaming::ByteStream;
use crate::transport::{BlobStore, PutOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMultipartOpts, WriteMultipart,
};
use std::sync::Arc;
use tracing::debug;

/// Multipart part size for uploads
pub const UPLOAD_PART_SIZE: usize = 64 * 1024 * 1024; // 64MB

/// Maximum keys per delete request (S3 limit)
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Parts uploaded concurrently per object
const MAX_INFLIGHT_PARTS: usize = 4;

/// Blob backend over an `object_store` store.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    /// Whether the store accepts object attributes (content type, storage class)
    attributes: bool,
    part_size: usize,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            attributes: true,
            part_size: UPLOAD_PART_SIZE,
        }
    }

    /// Build the backend described by the storage section of the config.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let backend = match config.backend {
            BackendKind::S3 => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(config.bucket.clone().unwrap_or_default())
                    .with_allow_http(config.allow_http);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let store = builder
                    .build()
                    .map_err(|e| SyncError::Config(format!("S3 backend: {}", e)))?;
                Self::new(Arc::new(store))
            }
            BackendKind::Gcs => {
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(config.bucket.clone().unwrap_or_default())
                    .build()
                    .map_err(|e| SyncError::Config(format!("GCS backend: {}", e)))?;
                Self::new(Arc::new(store))
            }
            BackendKind::Local => {
                let root = config.root.as_ref().ok_or_else(|| {
                    SyncError::Config("storage.root is required for the local backend".to_string())
                })?;
                std::fs::create_dir_all(root)?;
                let store = LocalFileSystem::new_with_prefix(root)
                    .map_err(|e| SyncError::Config(format!("local backend: {}", e)))?;
                // Attributes are not persisted by the local filesystem store
                Self::new(Arc::new(store)).without_attributes()
            }
            BackendKind::Memory => Self::new(Arc::new(InMemory::new())),
        };
        Ok(backend)
    }

    pub fn without_attributes(mut self) -> Self {
        self.attributes = false;
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    fn attributes_for(&self, opts: &PutOptions) -> Attributes {
        let mut attributes = Attributes::new();
        if !self.attributes {
            return attributes;
        }
        if let Some(content_type) = &opts.content_type {
            attributes.insert(
                Attribute::ContentType,
                AttributeValue::from(content_type.clone()),
            );
        }
        if let Some(class) = &opts.storage_class {
            attributes.insert(Attribute::StorageClass, AttributeValue::from(class.clone()));
        }
        attributes
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let location = parse_key("get", key)?;
        match self.store.get(&location).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| SyncError::backend("get", key, e))?;
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(SyncError::backend("get", key, e)),
        }
    }

    async fn put(&self, key: &str, mut body: ByteStream, opts: &PutOptions) -> Result<()> {
        let location = parse_key("put", key)?;
        let put_opts = PutMultipartOpts {
            attributes: self.attributes_for(opts),
            ..Default::default()
        };

        let upload = self
            .store
            .put_multipart_opts(&location, put_opts)
            .await
            .map_err(|e| SyncError::backend("put", key, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    if let Err(abort_err) = writer.abort().await {
                        debug!(key, error = %abort_err, "Failed to abort multipart upload");
                    }
                    return Err(SyncError::Io(err));
                }
            };
            if let Err(e) = writer.wait_for_capacity(MAX_INFLIGHT_PARTS).await {
                if let Err(abort_err) = writer.abort().await {
                    debug!(key, error = %abort_err, "Failed to abort multipart upload");
                }
                return Err(SyncError::backend("put", key, e));
            }
            writer.put(chunk);
        }

        writer
            .finish()
            .await
            .map_err(|e| SyncError::backend("put", key, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let location = parse_key("list", prefix)?;
        let mut listing = self.store.list(Some(&location));
        let mut keys = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(|e| SyncError::backend("list", prefix, e))?;
            keys.push(meta.location.to_string());
        }
        Ok(keys)
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let locations = batch
                .iter()
                .map(|k| parse_key("delete", k))
                .collect::<Result<Vec<Path>>>()?;
            let input = futures::stream::iter(locations.into_iter().map(Ok)).boxed();
            let mut results = self.store.delete_stream(input);
            while let Some(result) = results.next().await {
                match result {
                    Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => {
                        return Err(SyncError::backend(
                            "delete",
                            format!("batch of {} keys", batch.len()),
                            e,
                        ))
                    }
                }
            }
            debug!(count = batch.len(), "Deleted batch");
        }
        Ok(())
    }
}

/// Keys are already encoded; parse them as-is rather than encoding again.
fn parse_key(op: &'static str, key: &str) -> Result<Path> {
    Path::parse(key).map_err(|e| SyncError::backend(op, key, e.into()))
}
