//! arcsync - keep a bucket of compressed archives in sync with a local tree.
//!
//! The tree is cut into sync units (files, or whole subtrees at a chosen
//! depth). Each run fingerprints every unit from file names and sizes,
//! uploads the units whose fingerprint changed as `.tar.zst` archives, and
//! deletes archives whose unit is gone. The fingerprint of every committed
//! upload is kept in a metadata store object next to the archives.

pub mod config;
pub mod error;
pub mod path;
pub mod state;
pub mod streaming;
pub mod sync;
pub mod transport;

pub use error::{Result, SyncError};
pub use sync::{run, Reconciler, RunInput, RunOutput};
