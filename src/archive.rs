//! Format dispatch and the public `Archive` / `Reader` pair.
//!
//! An [`Archive`] owns the immutable parts: the byte provider and the parsed
//! block index. A [`Reader`] owns one mutable decode state and must not be
//! shared between threads; any number of readers can be created from the
//! same archive.

use std::path::Path;
use std::sync::Arc;

use crate::decode::ReaderState;
use crate::idxdefl::{self, InflateBlockCodec};
use crate::index::BlockIndex;
use crate::source::{FileSource, MmapSource, ReadAt, SourceCursor};
use crate::xz::{self, XzBlockCodec};
use crate::{ArchiveOptions, Error, Result};

enum Layout {
    Xz { streams: Arc<Vec<[u8; 2]>> },
    IdxDefl,
}

/// An open block-compressed container: byte provider plus block index.
pub struct Archive {
    source: Arc<dyn ReadAt>,
    index: Arc<BlockIndex>,
    layout: Layout,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive").finish_non_exhaustive()
    }
}

impl Archive {
    /// Open a container with positional reads, auto-detecting the format.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_source(Arc::new(FileSource::open(path)?), ArchiveOptions::default())
    }

    /// Open a container through a whole-file memory map.
    pub fn open_mmap<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_source(Arc::new(MmapSource::open(path)?), ArchiveOptions::default())
    }

    /// Open a container over an arbitrary byte provider.
    ///
    /// The first 8 bytes decide the format: the `idxdefl` magic selects the
    /// custom container, anything else is treated as XZ (and must end in a
    /// valid XZ Stream Footer).
    pub fn with_source(source: Arc<dyn ReadAt>, options: ArchiveOptions) -> Result<Self> {
        if source.size() < 8 {
            return Err(Error::CorruptContainer(
                "file too small for any supported container".into(),
            ));
        }
        let mut magic = [0u8; 8];
        source.read_exact_at(0, &mut magic)?;

        if magic == idxdefl::MAGIC {
            let index = idxdefl::read_index(&source, options.index_memlimit)?;
            Ok(Self {
                source,
                index: Arc::new(index),
                layout: Layout::IdxDefl,
            })
        } else {
            let (index, streams) = xz::read_index(&source, options.index_memlimit)?;
            Ok(Self {
                source,
                index: Arc::new(index),
                layout: Layout::Xz {
                    streams: Arc::new(streams),
                },
            })
        }
    }

    /// Total size of the decoded stream.
    pub fn uncompressed_size(&self) -> u64 {
        self.index.uncompressed_size()
    }

    /// Create a reader with its own decoder state. Readers stay valid after
    /// the archive itself is dropped.
    pub fn reader(&self) -> Reader {
        let cursor = SourceCursor::new(Arc::clone(&self.source));
        let index = Arc::clone(&self.index);
        let inner = match &self.layout {
            Layout::Xz { streams } => {
                Inner::Xz(ReaderState::new(index, cursor, XzBlockCodec::new(Arc::clone(streams))))
            }
            Layout::IdxDefl => {
                Inner::IdxDefl(ReaderState::new(index, cursor, InflateBlockCodec::new()))
            }
        };
        Reader { inner: Some(inner) }
    }
}

enum Inner {
    Xz(ReaderState<XzBlockCodec>),
    IdxDefl(ReaderState<InflateBlockCodec>),
}

/// A seekable view of the decoded stream. Holds live decoder state, so each
/// reader belongs to one thread at a time.
pub struct Reader {
    inner: Option<Inner>,
}

impl Reader {
    /// Open `path` and return a reader over it, auto-detecting the format.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Archive::open(path)?.reader())
    }

    fn state(&mut self) -> Result<&mut Inner> {
        self.inner.as_mut().ok_or(Error::NotOpen)
    }

    /// Total size of the decoded stream.
    pub fn uncompressed_size(&self) -> Result<u64> {
        match self.inner.as_ref().ok_or(Error::NotOpen)? {
            Inner::Xz(s) => Ok(s.uncompressed_size()),
            Inner::IdxDefl(s) => Ok(s.uncompressed_size()),
        }
    }

    /// Fill `dst` with the plaintext bytes starting at uncompressed `offset`.
    ///
    /// On failure the destination contents are unspecified and the decoder
    /// restarts from the index on the next call; the reader stays usable.
    pub fn read_into(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        match self.state()? {
            Inner::Xz(s) => s.read_into(offset, dst),
            Inner::IdxDefl(s) => s.read_into(offset, dst),
        }
    }

    /// Read up to `max` bytes at `offset` without copying into a caller
    /// buffer. The returned view is at least 1 byte (unless `max` is 0),
    /// never crosses a block boundary, and is only valid until the next
    /// call on this reader.
    pub fn read(&mut self, offset: u64, max: usize) -> Result<&[u8]> {
        match self.state()? {
            Inner::Xz(s) => s.read(offset, max),
            Inner::IdxDefl(s) => s.read(offset, max),
        }
    }

    /// Host-adapter convenience: read `count` big-endian u32 values starting
    /// at uncompressed byte `offset`.
    pub fn read_u32s_be(&mut self, offset: u64, count: usize) -> Result<Vec<u32>> {
        let len = count
            .checked_mul(4)
            .ok_or_else(|| Error::OutOfRange("integer count overflows".into()))?;
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf
            .chunks_exact(4)
            .map(|raw| u32::from_be_bytes(raw.try_into().expect("4-byte chunk")))
            .collect())
    }

    /// Release the decoder state. Further calls fail with [`Error::NotOpen`].
    /// Dropping the reader has the same effect.
    pub fn close(&mut self) {
        self.inner = None;
    }
}
