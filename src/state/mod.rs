// Metadata store: remote key -> fingerprint of the last committed upload.
//
// One store per run. Loaded from a single well-known object at start,
// mutated in memory while the run progresses, written back once at the end.
// Format: bincode-encoded versioned envelope.

use crate::error::{Result, SyncError};
use crate::streaming::ByteStream;
use crate::sync::fingerprint::Fingerprint;
use crate::transport::{BlobStore, PutOptions};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use tracing::{debug, info};

/// Default key of the metadata store object
pub const DEFAULT_METADATA_KEY: &str = "arcsync-metadata.bin";

/// Content type of the metadata store object
pub const METADATA_CONTENT_TYPE: &str = "application/octet-stream";

/// On-the-wire envelope
#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// In-memory metadata store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataStore {
    entries: BTreeMap<String, Fingerprint>,
}

impl MetadataStore {
    /// Format version
    const FORMAT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Fingerprint> {
        self.entries.get(key)
    }

    /// Whether `key` was last uploaded with exactly `fingerprint`.
    pub fn is_current(&self, key: &str, fingerprint: &Fingerprint) -> bool {
        self.entries.get(key) == Some(fingerprint)
    }

    /// Record a committed upload, returning the previous fingerprint.
    pub fn record(&mut self, key: impl Into<String>, fingerprint: Fingerprint) -> Option<Fingerprint> {
        self.entries.insert(key.into(), fingerprint)
    }

    pub fn remove(&mut self, key: &str) -> Option<Fingerprint> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let file = MetadataFile {
            version: Self::FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().to_string()))
                .collect(),
        };
        let bytes = bincode::serialize(&file)
            .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        Ok(Bytes::from(bytes))
    }

    /// Decode a persisted store; `key` is only used for error reporting.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self> {
        let file: MetadataFile =
            bincode::deserialize(bytes).map_err(|e| SyncError::MetadataDecode {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if file.version != Self::FORMAT_VERSION {
            return Err(SyncError::MetadataDecode {
                key: key.to_string(),
                reason: format!("unsupported format version {}", file.version),
            });
        }

        Ok(Self {
            entries: file
                .entries
                .into_iter()
                .map(|(k, v)| (k, Fingerprint::from(v)))
                .collect(),
        })
    }

    /// Load the store from `key`; a missing object yields an empty store.
    pub async fn load(backend: &dyn BlobStore, key: &str) -> Result<Self> {
        debug!(key, "Loading metadata store");
        match backend.get(key).await? {
            Some(bytes) => {
                let store = Self::decode(key, &bytes)?;
                info!(key, count = store.len(), "Loaded metadata store");
                Ok(store)
            }
            None => {
                info!(key, "Metadata store not found, starting empty");
                Ok(Self::new())
            }
        }
    }

    /// Write the store back to `key`.
    pub async fn save(&self, backend: &dyn BlobStore, key: &str) -> Result<()> {
        let bytes = self.encode()?;
        let size = bytes.len();
        let body: ByteStream = futures::stream::once(async move { Ok(bytes) }).boxed();
        let opts = PutOptions {
            content_type: Some(METADATA_CONTENT_TYPE.to_string()),
            storage_class: None,
        };
        backend.put(key, body, &opts).await?;
        debug!(key, size, count = self.len(), "Saved metadata store");
        Ok(())
    }
}
