//! Archiver: streams a sync unit into a zstd-compressed tar container.

use crate::path::to_slash;
use crate::streaming::channel::{archive_channel, ArchiveStream, ChannelWriter};
use crate::sync::partition::ignore_to_io;
use ignore::WalkBuilder;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content type of produced archives
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zstd";

/// zstd level for archives
pub const ARCHIVE_ZSTD_LEVEL: i32 = 3;

/// Start archiving `path` in the background and return the byte stream.
///
/// Must be called from within a Tokio runtime. The archive is produced on
/// a blocking thread as the stream is consumed; a read or walk failure
/// poisons the stream.
pub fn open_archive_stream(path: PathBuf) -> ArchiveStream {
    let (writer, stream) = archive_channel();
    let poisoner = writer.poisoner();

    tokio::task::spawn_blocking(move || {
        if let Err(err) = write_archive(&path, writer) {
            debug!(path = %path.display(), error = %err, "Archive producer stopped");
            poisoner.poison(err);
        }
    });

    stream
}

fn write_archive(path: &Path, writer: ChannelWriter) -> io::Result<()> {
    let encoder = zstd::stream::write::Encoder::new(writer, ARCHIVE_ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for (abs, name) in archive_entries(path)? {
        builder.append_path_with_name(&abs, &name)?;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()
}

/// (absolute path, entry name) for every non-directory entry of the unit.
fn archive_entries(path: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![(path.to_path_buf(), name)]);
    }

    let walker = WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(ignore_to_io)?;
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        entries.push((entry.path().to_path_buf(), to_slash(rel)));
    }
    Ok(entries)
}
