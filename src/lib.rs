//! Seekable random-access reads over block-compressed container files.
//!
//! Two container layouts are supported, both consisting of independently
//! decompressible blocks plus an index mapping uncompressed offsets to
//! compressed offsets:
//!
//! - **XZ**: the standard `.xz` stream format. One or more concatenated
//!   Streams (optionally separated by zero padding), each with a trailing
//!   Index record listing its block sizes. Files produced with
//!   `xz --block-size=...` give useful seek granularity.
//! - **idxdefl**: a minimal custom container of fixed-size raw-DEFLATE
//!   blocks with a compressed table of per-block sizes and a 16-byte footer.
//!   The `idx-deflate` tool (and [`idxdefl::compress_file`]) writes it.
//!
//! Reads at arbitrary uncompressed offsets decompress only the blocks the
//! request intersects. A block is decoded at most up to the last requested
//! byte; sequential reads continue an already-running block decoder instead
//! of restarting it.
//!
//! # Usage
//!
//! ```no_run
//! use blockseek::Archive;
//!
//! fn dump_window() -> blockseek::Result<()> {
//!     let archive = Archive::open("map-data.xz")?;
//!     let mut reader = archive.reader();
//!
//!     let mut buf = vec![0u8; 4096];
//!     reader.read_into(1 << 20, &mut buf)?;
//!
//!     // Readers are cheap; each one carries its own decoder state, so a
//!     // second reader can serve an unrelated offset without disturbing
//!     // the first.
//!     let mut other = archive.reader();
//!     let head = other.read(0, 16)?;
//!     assert_eq!(head.len(), 16);
//!     Ok(())
//! }
//! ```

mod archive;
mod decode;
mod index;
mod source;
mod xz;

pub mod idxdefl;

pub use archive::{Archive, Reader};
pub use source::{FileSource, MmapSource, ReadAt, SourceCursor};

/// Default cap on memory spent holding a container's block index.
pub const DEFAULT_INDEX_MEMLIMIT: u64 = 16 * 1024 * 1024;

/// Compressed input is pulled from the byte provider in chunks of this size;
/// it is also the size of the per-reader skip scratch buffer.
pub(crate) const CHUNK_SIZE: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("reader is closed")]
    NotOpen,
    #[error("offset or length out of range: {0}")]
    OutOfRange(String),
    #[error("corrupt container: {0}")]
    CorruptContainer(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unexpected end of input: {0}")]
    UnexpectedEof(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tuning knobs for opening an archive.
#[derive(Copy, Clone, Debug)]
pub struct ArchiveOptions {
    /// Hard cap on cumulative block-index memory. Exceeding it fails the
    /// open with [`Error::ResourceLimit`].
    pub index_memlimit: u64,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            index_memlimit: DEFAULT_INDEX_MEMLIMIT,
        }
    }
}
