//! Remote key naming and path helpers.

use object_store::path::Path as ObjectPath;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Suffix appended to every archive key
pub const ARCHIVE_EXT: &str = "tar.zst";

/// Sentinel unit name for "the whole root"
pub const SELF_UNIT: &str = ".";

/// Destination identifier of a unit's archive in the blob backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteKey(String);

impl RemoteKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RemoteKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives remote keys for one run: `prefix/<root base name>/<unit>.tar.zst`.
///
/// Keys only depend on the prefix and the root's base name, so they stay
/// stable across runs and machines as long as neither changes. Every
/// segment is percent-encoded the way `object_store` encodes path parts,
/// so a derived key compares equal to the same key coming back from a
/// listing.
#[derive(Debug, Clone)]
pub struct KeyNamer {
    prefix: Vec<String>,
    root_name: String,
}

impl KeyNamer {
    pub fn new(prefix: &str, root: &Path) -> Self {
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            prefix: segments([prefix]),
            root_name,
        }
    }

    /// The encoded destination prefix (no leading or trailing slash).
    pub fn prefix(&self) -> String {
        encode(self.prefix.iter().map(String::as_str))
    }

    pub fn key_for(&self, unit: &str) -> RemoteKey {
        let mut parts = self.prefix.clone();
        parts.extend(segments([self.root_name.as_str(), unit]));
        if let Some(last) = parts.last_mut() {
            last.push('.');
            last.push_str(ARCHIVE_EXT);
        }
        RemoteKey(encode(parts.iter().map(String::as_str)))
    }
}

/// Encode an arbitrary slash-separated name (such as the metadata key) into
/// its object key form.
pub fn object_key(name: &str) -> RemoteKey {
    let parts = segments([name]);
    RemoteKey(encode(parts.iter().map(String::as_str)))
}

fn encode<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    ObjectPath::from_iter(parts).to_string()
}

/// Split into slash-separated segments, dropping empty and `.` segments.
fn segments<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        for seg in part.split(['/', '\\']) {
            match seg {
                "" | "." => {}
                ".." => {
                    out.pop();
                }
                s => out.push(s.to_string()),
            }
        }
    }
    out
}

/// Render a relative path with `/` separators regardless of platform.
pub fn to_slash(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        SELF_UNIT.to_string()
    } else {
        parts.join("/")
    }
}

/// Replace a leading `~` component with the home directory.
///
/// `~user` forms are left alone, as is everything when no home directory
/// is known.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let (Ok(rest), Some(home)) = (path.strip_prefix("~"), dirs::home_dir()) else {
        return path.to_path_buf();
    };
    if rest.as_os_str().is_empty() {
        home
    } else {
        home.join(rest)
    }
}
