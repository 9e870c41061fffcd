//! TOML configuration for the `arcsync` binary.

use crate::error::{Result, SyncError};
use crate::path::expand_tilde;
use crate::state::DEFAULT_METADATA_KEY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of units fingerprinted or uploaded at once
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dry_run: bool,

    /// Key of the metadata store object in the bucket
    #[serde(default = "default_metadata_key")]
    pub metadata_key: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    pub storage: StorageConfig,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    S3,
    Gcs,
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Bucket name (s3, gcs)
    #[serde(default)]
    pub bucket: Option<String>,

    /// AWS region; falls back to the environment
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (MinIO and friends)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub allow_http: bool,

    /// Directory acting as the bucket (local)
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Storage class for archives, e.g. `STANDARD_IA` or `DEEP_ARCHIVE`
    #[serde(default)]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// Local directory to back up
    pub path: PathBuf,

    /// Partition depth; 0 uploads the whole directory as one archive
    #[serde(default)]
    pub max_depth: usize,

    /// Destination prefix inside the bucket
    #[serde(default)]
    pub prefix: String,
}

fn default_metadata_key() -> String {
    DEFAULT_METADATA_KEY.to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        for target in &mut self.targets {
            target.path = expand_tilde(&target.path);
        }
        if let Some(root) = &self.storage.root {
            self.storage.root = Some(expand_tilde(root));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(SyncError::Config("no targets configured".to_string()));
        }
        if self.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".to_string()));
        }
        if self.metadata_key.trim_matches('/').is_empty() {
            return Err(SyncError::Config("metadata_key must not be empty".to_string()));
        }
        match self.storage.backend {
            BackendKind::S3 | BackendKind::Gcs => {
                if self.storage.bucket.as_deref().unwrap_or("").is_empty() {
                    return Err(SyncError::Config(format!(
                        "storage.bucket is required for the {:?} backend",
                        self.storage.backend
                    )));
                }
            }
            BackendKind::Local => {
                if self.storage.root.is_none() {
                    return Err(SyncError::Config(
                        "storage.root is required for the local backend".to_string(),
                    ));
                }
            }
            BackendKind::Memory => {}
        }
        for target in &self.targets {
            if target.path.as_os_str().is_empty() {
                return Err(SyncError::Config("target path must not be empty".to_string()));
            }
        }
        // Reclaim deletes everything stale under a target's prefix, so no
        // prefix may contain another target's
        for (i, a) in self.targets.iter().enumerate() {
            for b in &self.targets[i + 1..] {
                if prefixes_overlap(&a.prefix, &b.prefix) {
                    return Err(SyncError::Config(format!(
                        "targets {} and {} have overlapping prefixes {:?} and {:?}",
                        a.path.display(),
                        b.path.display(),
                        a.prefix,
                        b.prefix
                    )));
                }
            }
        }
        Ok(())
    }
}

fn prefixes_overlap(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('/').filter(|s| !s.is_empty()).collect();
    let b: Vec<&str> = b.split('/').filter(|s| !s.is_empty()).collect();
    a.starts_with(&b) || b.starts_with(&a)
}
