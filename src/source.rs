//! Random-access byte providers and the windowed cursor the decoders pull
//! compressed input through.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::{Error, Result};

/// Random-access byte source backing an archive.
///
/// `size()` is stable for the lifetime of the provider, and a successful
/// `read_exact_at` fills the whole buffer. Providers are shared by reference
/// across readers; they carry no per-reader mutable state.
pub trait ReadAt: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` with the bytes at `offset`, or fail.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_range(size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange(format!(
            "read of {len} bytes at {offset} exceeds source size {size}"
        ))),
    }
}

/// Positional-read provider over an open file.
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ReadAt for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    return Err(Error::UnexpectedEof(format!(
                        "file shrank below its reported size at offset {}",
                        offset + filled as u64
                    )));
                }
                filled += n;
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::UnexpectedEof(format!(
                        "file shrank below its reported size at offset {offset}"
                    ))
                } else {
                    Error::Io(e)
                }
            })
        }
    }
}

/// Whole-file memory-map provider.
///
/// Reads become plain copies out of the mapping; the page cache does the
/// rest. The mapping is immutable and shared across all readers.
pub struct MmapSource {
    map: Mmap,
}

impl MmapSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the map is read-only and private to this process; mutation
        // of the underlying file during reads is outside the supported model.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }
}

impl ReadAt for MmapSource {
    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.map[start..start + buf.len()]);
        Ok(())
    }
}

/// In-memory provider, mainly for tests and synthetic inputs.
impl ReadAt for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self[start..start + buf.len()]);
        Ok(())
    }
}

/// Sequential cursor over a provider, restricted to a window of it.
///
/// Seeking clamps the window to the provider size, so a truncated file shows
/// up as a short window rather than a provider error; the decoders turn that
/// into `UnexpectedEof` when they run dry.
pub struct SourceCursor {
    source: Arc<dyn ReadAt>,
    offset: u64,
    remaining: u64,
}

impl SourceCursor {
    pub fn new(source: Arc<dyn ReadAt>) -> Self {
        let mut cursor = Self {
            source,
            offset: 0,
            remaining: 0,
        };
        cursor.seek(0, None);
        cursor
    }

    /// Position the cursor at `offset`, limited to `length` bytes
    /// (`None` = through end of source). The window is clamped to the
    /// source size.
    pub fn seek(&mut self, offset: u64, length: Option<u64>) {
        let size = self.source.size();
        self.offset = offset;
        self.remaining = if offset >= size {
            0
        } else {
            let to_end = size - offset;
            length.map_or(to_end, |len| len.min(to_end))
        };
    }

    /// Next read offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes left in the window.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read up to `buf.len()` bytes, bounded by the window. Returns 0 once
    /// the window is exhausted; that is not an error.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = (buf.len() as u64).min(self.remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.source.read_exact_at(self.offset, &mut buf[..want])?;
        self.offset += want as u64;
        self.remaining -= want as u64;
        Ok(want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_clamps_window_to_source() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut cursor = SourceCursor::new(Arc::new(data));

        cursor.seek(90, Some(50));
        assert_eq!(cursor.remaining(), 10);

        cursor.seek(200, Some(10));
        assert_eq!(cursor.remaining(), 0);

        let mut buf = [0u8; 8];
        cursor.seek(96, None);
        assert_eq!(cursor.read_chunk(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[96, 97, 98, 99]);
        assert_eq!(cursor.read_chunk(&mut buf).unwrap(), 0);
    }

    #[test]
    fn vec_source_rejects_out_of_range() {
        let data = vec![0u8; 16];
        let mut buf = [0u8; 4];
        assert!(matches!(
            data.read_exact_at(14, &mut buf),
            Err(Error::OutOfRange(_))
        ));
    }
}
