//! Tree partitioning: split a root into sync units at a maximum depth.

use crate::error::{Result, SyncError};
use crate::path::{to_slash, SELF_UNIT};
use ignore::WalkBuilder;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// A file or depth-truncated subtree tracked and uploaded as one archive.
///
/// Identified by its `/`-separated path relative to the root; the whole
/// root is [`SELF_UNIT`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncUnit(String);

impl SyncUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn whole_root() -> Self {
        Self(SELF_UNIT.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Absolute location of this unit under `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        if self.0 == SELF_UNIT {
            root.to_path_buf()
        } else {
            root.join(&self.0)
        }
    }
}

impl fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Walk `root` and return its sync units for `max_depth`.
///
/// Directories at exactly `max_depth` become one unit and are not
/// descended. Non-directory entries at or above that depth are their own
/// unit. Depth 0 yields the whole root as a single unit.
pub fn partition(root: &Path, max_depth: usize) -> Result<Vec<SyncUnit>> {
    if max_depth == 0 {
        return Ok(vec![SyncUnit::whole_root()]);
    }

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .max_depth(Some(max_depth))
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut units = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| traversal_error(root, e))?;
        let depth = entry.depth();
        if depth == 0 {
            continue;
        }

        let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
        if is_dir && depth < max_depth {
            continue;
        }

        let rel = entry.path().strip_prefix(root).map_err(|_| SyncError::Traversal {
            path: entry.path().to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, "entry escaped the root"),
        })?;
        units.push(SyncUnit::new(to_slash(rel)));
    }

    units.sort();
    Ok(units)
}

pub(crate) fn traversal_error(root: &Path, err: ignore::Error) -> SyncError {
    SyncError::Traversal {
        path: root.to_path_buf(),
        source: ignore_to_io(err),
    }
}

pub(crate) fn ignore_to_io(err: ignore::Error) -> io::Error {
    let msg = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg))
}
