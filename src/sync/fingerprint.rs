//! Structural fingerprints of sync units.
//!
//! A fingerprint covers the sorted set of (relative path, size) pairs in a
//! unit. File contents are never read, so a rewrite that keeps every size
//! unchanged is invisible here. Callers that need content-level change
//! detection must not rely on this digest.

use crate::path::to_slash;
use crate::sync::partition::ignore_to_io;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

const FINGERPRINT_PREFIX: &str = "b3:";

/// Opaque change-detection digest of a sync unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint plus the unit's total byte size, gathered in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDigest {
    pub fingerprint: Fingerprint,
    pub size: u64,
}

/// Fingerprint the file or directory at `path`.
///
/// Blocking; run it off the async runtime.
pub fn fingerprint(path: &Path) -> io::Result<UnitDigest> {
    let meta = fs::symlink_metadata(path)?;
    let entries = if meta.is_dir() {
        list_entries(path)?
    } else {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![(name, meta.len())]
    };
    Ok(digest_entries(entries))
}

/// Every non-directory entry under `dir` with its size, paths relative to `dir`.
fn list_entries(dir: &Path) -> io::Result<Vec<(String, u64)>> {
    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .build();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(ignore_to_io)?;
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            continue;
        }
        // Stat again: the listing may be stale if the entry vanished since
        let size = fs::symlink_metadata(entry.path())?.len();
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        entries.push((to_slash(rel), size));
    }
    Ok(entries)
}

/// Fold (size, path) pairs into a digest, independent of input order.
pub fn digest_entries(mut entries: Vec<(String, u64)>) -> UnitDigest {
    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = blake3::Hasher::new();
    let mut total = 0u64;
    for (path, size) in &entries {
        hasher.update(&size.to_le_bytes());
        hasher.update(&(path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        total = total.saturating_add(*size);
    }

    UnitDigest {
        fingerprint: Fingerprint(format!(
            "{}{}",
            FINGERPRINT_PREFIX,
            hex::encode(hasher.finalize().as_bytes())
        )),
        size: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a1.txt", "a1");
        write(tmp.path(), "foo/b1.txt", "b1");
        write(tmp.path(), "foo/b2.txt", "b2");
        write(tmp.path(), "foo/bar/c1.txt", "c1");
        write(tmp.path(), "baz/d1.txt", "d1");
        tmp
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let tmp = sample_tree();
        let first = fingerprint(tmp.path()).unwrap();
        let second = fingerprint(tmp.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, 10);
        assert!(first.fingerprint.as_str().starts_with("b3:"));
    }

    #[test]
    fn test_same_size_rewrite_is_invisible() {
        let tmp = sample_tree();
        let before = fingerprint(tmp.path()).unwrap();
        fs::write(tmp.path().join("a1.txt"), "zz").unwrap();
        let after = fingerprint(tmp.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_size_change_is_detected() {
        let tmp = sample_tree();
        let before = fingerprint(tmp.path()).unwrap();
        fs::write(tmp.path().join("a1.txt"), "a1a1").unwrap();
        let after = fingerprint(tmp.path()).unwrap();
        assert_ne!(before.fingerprint, after.fingerprint);
    }

    #[test]
    fn test_removal_and_rename_are_detected() {
        let tmp = sample_tree();
        let before = fingerprint(tmp.path()).unwrap();

        fs::rename(tmp.path().join("a1.txt"), tmp.path().join("a2.txt")).unwrap();
        let renamed = fingerprint(tmp.path()).unwrap();
        assert_ne!(before.fingerprint, renamed.fingerprint);

        fs::remove_dir_all(tmp.path().join("baz")).unwrap();
        let removed = fingerprint(tmp.path()).unwrap();
        assert_ne!(renamed.fingerprint, removed.fingerprint);
    }

    #[test]
    fn test_single_file_ignores_location() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "x/notes.txt", "hello");
        write(b.path(), "y/z/notes.txt", "world");

        let fa = fingerprint(&a.path().join("x/notes.txt")).unwrap();
        let fb = fingerprint(&b.path().join("y/z/notes.txt")).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(fa.size, 5);
    }

    #[test]
    fn test_missing_path_errors() {
        let tmp = TempDir::new().unwrap();
        let err = fingerprint(&tmp.path().join("gone")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_path_boundaries_matter() {
        // ("ab", 1) + ("c", 1) must not collide with ("a", 1) + ("bc", 1)
        let left = digest_entries(vec![("ab".into(), 1), ("c".into(), 1)]);
        let right = digest_entries(vec![("a".into(), 1), ("bc".into(), 1)]);
        assert_ne!(left.fingerprint, right.fingerprint);
    }

    proptest! {
        #[test]
        fn prop_order_independent(
            mut entries in proptest::collection::btree_map("[a-z/]{1,12}", 0u64..1_000_000, 0..32)
                .prop_map(|m| m.into_iter().collect::<Vec<_>>()),
            seed in any::<u64>(),
        ) {
            let expected = digest_entries(entries.clone());
            // Deterministic shuffle driven by the seed
            let len = entries.len();
            if len > 1 {
                let mut s = seed;
                for i in (1..len).rev() {
                    s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = (s >> 33) as usize % (i + 1);
                    entries.swap(i, j);
                }
            }
            prop_assert_eq!(digest_entries(entries), expected);
        }
    }
}
