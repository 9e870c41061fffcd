use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cannot read local tree at {path}: {source}")]
    Traversal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to fingerprint {unit}: {source}")]
    Hash {
        unit: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to archive {unit}: {source}")]
    Archive {
        unit: String,
        #[source]
        source: io::Error,
    },

    #[error("Backend {op} failed for {key}: {source}")]
    Backend {
        op: &'static str,
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("Metadata store at {key} is corrupt: {reason}")]
    MetadataDecode { key: String, reason: String },

    #[error("Upload of {unit} failed: {source}")]
    Upload {
        unit: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn backend(op: &'static str, key: impl Into<String>, source: object_store::Error) -> Self {
        SyncError::Backend {
            op,
            key: key.into(),
            source,
        }
    }

    /// Attach the failing unit's name to an error raised while uploading it.
    pub fn in_unit(self, unit: &str) -> Self {
        match self {
            // Already carries the unit name
            SyncError::Hash { .. } | SyncError::Archive { .. } | SyncError::Upload { .. } => self,
            SyncError::Cancelled => self,
            other => SyncError::Upload {
                unit: unit.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
