//! Per-reader decode state: current block, live decoder, position tracking,
//! and the skip/fill loops that turn block decoders into random access.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::index::{BlockEntry, BlockIndex};
use crate::source::SourceCursor;
use crate::{Error, Result, CHUNK_SIZE};

/// Outcome of one [`BlockCodec::decode`] call.
pub(crate) enum Progress {
    /// `n >= 1` bytes were written into the output slice; the block has more.
    Produced(usize),
    /// The block finished; `n` bytes (possibly 0) were written in this call.
    EndOfBlock(usize),
}

/// A per-format block decompressor. One instance lives inside each reader and
/// is re-initialized whenever the reader moves to a different block.
pub(crate) trait BlockCodec {
    /// Seek `cursor` to the block's compressed data and reset decoder state.
    fn begin_block(&mut self, cursor: &mut SourceCursor, entry: &BlockEntry) -> Result<()>;

    /// Decode into `out` (never empty), pulling compressed input through
    /// `cursor`. Returns once at least one byte has been produced or the
    /// block has ended.
    fn decode(&mut self, cursor: &mut SourceCursor, out: &mut [u8]) -> Result<Progress>;
}

/// Decode state for one open reader.
///
/// `position` is the uncompressed offset of `scratch[0]`; while it is `Some`,
/// `scratch[..written]` equals that range of the plaintext. A failed read
/// clears `position`, which forces a block relocation on the next call; the
/// index and byte provider stay usable.
pub(crate) struct ReaderState<C> {
    index: Arc<BlockIndex>,
    cursor: SourceCursor,
    codec: C,
    /// Ordinal of the block the codec is decoding; valid while `position` is.
    block: usize,
    position: Option<u64>,
    written: usize,
    scratch: Box<[u8]>,
}

impl<C: BlockCodec> ReaderState<C> {
    pub fn new(index: Arc<BlockIndex>, cursor: SourceCursor, codec: C) -> Self {
        Self {
            index,
            cursor,
            codec,
            block: 0,
            position: None,
            written: 0,
            scratch: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
        }
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.index.uncompressed_size()
    }

    /// Read exactly `dst.len()` bytes of plaintext starting at `offset`.
    pub fn read_into(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len() as u64)?;
        if dst.is_empty() {
            return Ok(());
        }

        let result = self.read_into_inner(offset, dst);
        if result.is_err() {
            self.position = None;
            self.written = 0;
        }
        result
    }

    /// Read up to `max` bytes of plaintext starting at `offset`, returning a
    /// view into the reader's own buffer. The view never crosses a block
    /// boundary and is invalidated by the next call.
    pub fn read(&mut self, offset: u64, max: usize) -> Result<&[u8]> {
        if max == 0 {
            return Ok(&[]);
        }
        self.check_range(offset, 1)?;

        match self.read_buffered_inner(offset, max) {
            Ok(n) => Ok(&self.scratch[..n]),
            Err(e) => {
                self.position = None;
                self.written = 0;
                Err(e)
            }
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let size = self.index.uncompressed_size();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Error::OutOfRange(format!(
                "request for {len} bytes at offset {offset} exceeds uncompressed size {size}"
            ))),
        }
    }

    fn read_into_inner(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.seek_block_for(offset)?;
        let position = self.position.expect("positioned after seek");
        self.skip_exact(offset - position)?;
        self.fill_exact(dst)?;

        // All delivered bytes are accounted into the position; nothing stays
        // buffered once the caller's buffer is unbound.
        self.position = Some(offset + dst.len() as u64);
        self.written = 0;
        Ok(())
    }

    fn read_buffered_inner(&mut self, offset: u64, max: usize) -> Result<usize> {
        self.seek_block_for(offset)?;
        let position = self.position.expect("positioned after seek");
        self.skip_exact(offset - position)?;

        let cap = max.min(self.scratch.len());
        loop {
            let progress = {
                let Self {
                    codec,
                    cursor,
                    scratch,
                    ..
                } = self;
                codec.decode(cursor, &mut scratch[..cap])?
            };
            match progress {
                Progress::Produced(n) | Progress::EndOfBlock(n) if n > 0 => {
                    self.written = n;
                    return Ok(n);
                }
                Progress::Produced(_) => unreachable!("codec reported empty progress"),
                Progress::EndOfBlock(_) => self.advance_block()?,
            }
        }
    }

    /// Position the decoder inside the block containing `offset`, deciding
    /// between continuing the current block, restarting it, or relocating.
    /// Any buffered output is discarded into `position`.
    fn seek_block_for(&mut self, offset: u64) -> Result<()> {
        self.check_range(offset, 1)?;

        let matching = match self.position {
            Some(_) => {
                let e = self.index.entry(self.block);
                offset >= e.uncompressed_offset
                    && offset < e.uncompressed_offset + e.uncompressed_len
            }
            None => false,
        };

        if matching {
            let position = self.position.expect("matching implies positioned");
            if position + self.written as u64 <= offset {
                trace!(offset, position, "continuing current block");
                self.discard();
                return Ok(());
            }
            debug!(offset, position, block = self.block, "restarting current block");
            self.discard();
            return self.load_block(self.block);
        }

        let ordinal = self.index.locate(offset).ok_or_else(|| {
            Error::OutOfRange(format!("no block contains uncompressed offset {offset}"))
        })?;
        trace!(offset, block = ordinal, "relocating to block");
        self.discard();
        self.load_block(ordinal)
    }

    fn discard(&mut self) {
        if let Some(position) = self.position {
            self.position = Some(position + self.written as u64);
        }
        self.written = 0;
    }

    fn load_block(&mut self, ordinal: usize) -> Result<()> {
        self.position = None;
        self.written = 0;
        let entry = *self.index.entry(ordinal);
        self.codec.begin_block(&mut self.cursor, &entry)?;
        self.block = ordinal;
        self.position = Some(entry.uncompressed_offset);
        Ok(())
    }

    fn advance_block(&mut self) -> Result<()> {
        let next = self.index.next(self.block).ok_or_else(|| {
            Error::UnexpectedEof("stream ended before the request was satisfied".into())
        })?;
        self.load_block(next)
    }

    /// Decode and discard exactly `skip` bytes through the scratch buffer,
    /// advancing `position` past them.
    fn skip_exact(&mut self, mut skip: u64) -> Result<()> {
        while skip > 0 {
            let want = (self.scratch.len() as u64).min(skip) as usize;
            let progress = {
                let Self {
                    codec,
                    cursor,
                    scratch,
                    ..
                } = self;
                codec.decode(cursor, &mut scratch[..want])?
            };
            let n = match progress {
                Progress::Produced(n) => n,
                Progress::EndOfBlock(n) => {
                    if n == 0 {
                        self.advance_block()?;
                        continue;
                    }
                    n
                }
            };
            skip -= n as u64;
            self.position = Some(self.position.expect("positioned during skip") + n as u64);
        }
        Ok(())
    }

    /// Fill `out` completely, walking to following blocks as each one runs
    /// out before the request is satisfied.
    fn fill_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let progress = {
                let Self { codec, cursor, .. } = self;
                codec.decode(cursor, &mut out[filled..])?
            };
            match progress {
                Progress::Produced(n) => filled += n,
                Progress::EndOfBlock(n) => {
                    filled += n;
                    if filled < out.len() {
                        self.advance_block()?;
                    }
                }
            }
        }
        Ok(())
    }
}
