//! Lazy archive production for uploads.
//!
//! # Architecture
//!
//! ```text
//! +------------------+   bounded chunks   +-----------------+
//! |  archive writer  | -----------------> |  ArchiveStream  | --> backend put
//! | (spawn_blocking) |   ChannelWriter    |  (async Stream) |
//! +------------------+                    +-----------------+
//! ```
//!
//! Upload starts as soon as the first chunk is ready. Dropping the
//! stream stops the writer; a writer failure poisons the stream.

pub mod archive;
pub mod channel;

pub use archive::{open_archive_stream, ARCHIVE_CONTENT_TYPE, ARCHIVE_ZSTD_LEVEL};
pub use channel::{
    archive_channel, ArchiveStream, ByteStream, ChannelWriter, Poisoner, ARCHIVE_CHANNEL_SIZE,
    ARCHIVE_CHUNK_SIZE,
};
