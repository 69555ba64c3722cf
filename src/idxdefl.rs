//! The `idxdefl` container: fixed-size plaintext blocks, each compressed
//! independently with raw DEFLATE, a compressed table of per-block sizes,
//! and a 16-byte big-endian footer.
//!
//! ```text
//! offset 0          : magic "idxdefl\0"
//! offset 8 .. X     : compressed data blocks (raw DEFLATE, no framing)
//! offset X .. EOF-16: raw DEFLATE of full_blocks big-endian u32 block sizes
//!                     (the last block's size is implied by the index start)
//! offset EOF-16..EOF: u32 BE footer: index_size, block_size, full_blocks,
//!                     last_block_size
//! ```

use std::fs::OpenOptions;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::core::{decompress, inflate_flags, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;
use tracing::debug;

use crate::decode::{BlockCodec, Progress};
use crate::index::{BlockEntry, BlockIndex};
use crate::source::{ReadAt, SourceCursor};
use crate::{Error, Result, CHUNK_SIZE};

pub(crate) const MAGIC: [u8; 8] = *b"idxdefl\0";
const FOOTER_SIZE: u64 = 16;

/// Raw DEFLATE matches can reach 32 KiB back, so the decode history window
/// must be at least that; it must also be a power of two because the inflate
/// core treats it as a ring.
const WINDOW_SIZE: u64 = 64 * 1024;

fn tinfl_message(status: TINFLStatus) -> &'static str {
    match status {
        TINFLStatus::BadParam => "bad parameters passed to the inflate engine",
        TINFLStatus::Adler32Mismatch => "adler-32 checksum mismatch",
        TINFLStatus::FailedCannotMakeProgress => "truncated deflate stream",
        TINFLStatus::Failed => "deflate data is corrupt",
        _ => "unknown inflate error",
    }
}

// ── Index reader ─────────────────────────────────────────────────────────────

/// Parse the footer and decompress the block-size table into a block index.
pub(crate) fn read_index(source: &Arc<dyn ReadAt>, memlimit: u64) -> Result<BlockIndex> {
    let size = source.size();
    if size < MAGIC.len() as u64 + FOOTER_SIZE {
        return Err(Error::CorruptContainer(
            "file too small for an idxdefl header and footer".into(),
        ));
    }

    let mut magic = [0u8; 8];
    source.read_exact_at(0, &mut magic)?;
    if magic != MAGIC {
        return Err(Error::CorruptContainer("bad idxdefl magic".into()));
    }

    let mut footer = [0u8; FOOTER_SIZE as usize];
    source.read_exact_at(size - FOOTER_SIZE, &mut footer)?;
    let mut fields = [0u32; 4];
    for (field, raw) in fields.iter_mut().zip(footer.chunks_exact(4)) {
        let value = u32::from_be_bytes(raw.try_into().expect("4-byte chunk"));
        if value > i32::MAX as u32 - 16 {
            return Err(Error::CorruptContainer(
                "footer field out of range".into(),
            ));
        }
        *field = value;
    }
    let [index_size, block_size, full_blocks, last_block_size] = fields;

    if block_size == 0 {
        return Err(Error::CorruptContainer("block size is zero".into()));
    }
    if last_block_size == 0 {
        return Err(Error::CorruptContainer(
            "last block size is zero".into(),
        ));
    }
    if last_block_size > block_size {
        return Err(Error::CorruptContainer(
            "last block larger than the block size".into(),
        ));
    }
    if u64::from(full_blocks) > (memlimit / 8).saturating_sub(256) {
        return Err(Error::ResourceLimit(format!(
            "{full_blocks} blocks exceed the index memory budget"
        )));
    }

    let uncompressed_size = u64::from(full_blocks)
        .checked_mul(u64::from(block_size))
        .and_then(|n| n.checked_add(u64::from(last_block_size)))
        .ok_or_else(|| Error::CorruptContainer("uncompressed size overflows".into()))?;

    let data_end = size - FOOTER_SIZE;
    if data_end < u64::from(index_size) + MAGIC.len() as u64 {
        return Err(Error::CorruptContainer("index size exceeds the file".into()));
    }
    let index_start = data_end - u64::from(index_size);

    let offsets = inflate_offsets(source, index_start, index_size, full_blocks)?;

    debug!(
        blocks = full_blocks + 1,
        block_size, uncompressed_size, "parsed idxdefl index"
    );

    let blocks = full_blocks as usize + 1;
    let mut entries = Vec::with_capacity(blocks);
    for k in 0..blocks {
        let last = k + 1 == blocks;
        entries.push(BlockEntry {
            uncompressed_offset: k as u64 * u64::from(block_size),
            uncompressed_len: if last {
                u64::from(last_block_size)
            } else {
                u64::from(block_size)
            },
            compressed_offset: offsets[k],
            compressed_len: offsets[k + 1] - offsets[k],
            stream: 0,
        });
    }
    BlockIndex::new(entries)
}

/// Stream-decompress the index region into `full_blocks + 2` compressed
/// offsets: `[8, 8 + len0, ..., index_start]`.
fn inflate_offsets(
    source: &Arc<dyn ReadAt>,
    index_start: u64,
    index_size: u32,
    full_blocks: u32,
) -> Result<Vec<u64>> {
    let mut offsets = Vec::with_capacity(full_blocks as usize + 2);
    let mut current = MAGIC.len() as u64;
    offsets.push(current);

    let mut cursor = SourceCursor::new(Arc::clone(source));
    cursor.seek(index_start, Some(u64::from(index_size)));

    let mut decomp = Box::new(DecompressorOxide::new());
    // 32 KiB ring: big enough for the DEFLATE window, consumed after every
    // decompress call.
    let mut window = vec![0u8; 32 * 1024];
    let mut produced_total: u64 = 0;
    let mut carry = [0u8; 4];
    let mut carry_len = 0usize;

    let mut input = [0u8; CHUNK_SIZE];
    let mut input_pos = 0usize;
    let mut input_len = 0usize;

    loop {
        if input_pos >= input_len {
            input_pos = 0;
            input_len = cursor.read_chunk(&mut input)?;
            if input_len == 0 {
                return Err(Error::CorruptContainer(
                    "compressed index ended before the deflate stream did".into(),
                ));
            }
        }

        let flags = if cursor.remaining() > 0 {
            inflate_flags::TINFL_FLAG_HAS_MORE_INPUT
        } else {
            0
        };
        let out_pos = (produced_total % window.len() as u64) as usize;
        let (status, consumed, produced) = decompress(
            &mut decomp,
            &input[input_pos..input_len],
            &mut window,
            out_pos,
            flags,
        );
        input_pos += consumed;
        produced_total += produced as u64;

        // The produced region may wrap around the ring.
        let head = produced.min(window.len() - out_pos);
        let (head_slice, tail_slice) = (
            &window[out_pos..out_pos + head],
            &window[..produced - head],
        );
        for &byte in head_slice.iter().chain(tail_slice) {
            carry[carry_len] = byte;
            carry_len += 1;
            if carry_len < 4 {
                continue;
            }
            carry_len = 0;
            if offsets.len() > full_blocks as usize {
                return Err(Error::CorruptContainer(
                    "decompressed index has more entries than the footer declares".into(),
                ));
            }
            let len = u64::from(u32::from_be_bytes(carry));
            current = current
                .checked_add(len)
                .ok_or_else(|| Error::CorruptContainer("compressed offset overflows".into()))?;
            offsets.push(current);
        }

        match status {
            TINFLStatus::Done => {
                if input_pos < input_len || cursor.remaining() > 0 {
                    return Err(Error::CorruptContainer(
                        "index deflate stream ended with input left over".into(),
                    ));
                }
                break;
            }
            TINFLStatus::NeedsMoreInput | TINFLStatus::HasMoreOutput => {}
            other => {
                return Err(Error::CorruptContainer(format!(
                    "index inflate failed: {}",
                    tinfl_message(other)
                )))
            }
        }
    }

    if carry_len != 0 {
        return Err(Error::CorruptContainer(
            "decompressed index is not a whole number of entries".into(),
        ));
    }
    if offsets.len() != full_blocks as usize + 1 {
        return Err(Error::CorruptContainer(format!(
            "decompressed index has {} entries, footer declares {full_blocks}",
            offsets.len() - 1
        )));
    }
    if current > index_start {
        return Err(Error::CorruptContainer(
            "compressed blocks reach into the index".into(),
        ));
    }

    // Boundary marker: the last block ends where the index begins.
    offsets.push(index_start);
    Ok(offsets)
}

// ── Block codec ──────────────────────────────────────────────────────────────

/// Raw-DEFLATE block decoder: a fresh `DecompressorOxide` per block, decoding
/// through a ring buffer that doubles as the DEFLATE history window.
pub(crate) struct InflateBlockCodec {
    decomp: Box<DecompressorOxide>,
    input: Box<[u8; CHUNK_SIZE]>,
    input_pos: usize,
    input_len: usize,
    window: Box<[u8]>,
    /// Bytes decoded into the ring (monotonic, not wrapped).
    win_dec: u64,
    /// Bytes handed out of the ring (monotonic, not wrapped).
    win_ret: u64,
    block_len: u64,
    done: bool,
}

impl InflateBlockCodec {
    pub fn new() -> Self {
        Self {
            decomp: Box::new(DecompressorOxide::new()),
            input: Box::new([0u8; CHUNK_SIZE]),
            input_pos: 0,
            input_len: 0,
            window: vec![0u8; WINDOW_SIZE as usize].into_boxed_slice(),
            win_dec: 0,
            win_ret: 0,
            block_len: 0,
            done: false,
        }
    }

    fn flush(&mut self, out: &mut [u8]) -> usize {
        let copied = ((self.win_dec - self.win_ret) as usize).min(out.len());
        let ret_idx = (self.win_ret % WINDOW_SIZE) as usize;
        let head = copied.min(WINDOW_SIZE as usize - ret_idx);
        out[..head].copy_from_slice(&self.window[ret_idx..ret_idx + head]);
        if head < copied {
            out[head..copied].copy_from_slice(&self.window[..copied - head]);
        }
        self.win_ret += copied as u64;
        copied
    }
}

impl BlockCodec for InflateBlockCodec {
    fn begin_block(&mut self, cursor: &mut SourceCursor, entry: &BlockEntry) -> Result<()> {
        cursor.seek(entry.compressed_offset, Some(entry.compressed_len));
        *self.decomp = DecompressorOxide::new();
        self.input_pos = 0;
        self.input_len = 0;
        self.win_dec = 0;
        self.win_ret = 0;
        self.block_len = entry.uncompressed_len;
        self.done = false;
        Ok(())
    }

    fn decode(&mut self, cursor: &mut SourceCursor, out: &mut [u8]) -> Result<Progress> {
        loop {
            if self.win_dec > self.win_ret {
                let n = self.flush(out);
                return Ok(Progress::Produced(n));
            }
            if self.done {
                return Ok(Progress::EndOfBlock(0));
            }

            if self.input_pos >= self.input_len {
                self.input_pos = 0;
                self.input_len = cursor.read_chunk(&mut self.input[..])?;
                if self.input_len == 0 {
                    return Err(Error::UnexpectedEof(
                        "compressed block ended before its plaintext was fully decoded".into(),
                    ));
                }
            }

            // The ring must be fully drained before decoding more, or the
            // decompressor would overwrite unread output.
            debug_assert_eq!(self.win_dec, self.win_ret);
            let flags = if cursor.remaining() > 0 {
                inflate_flags::TINFL_FLAG_HAS_MORE_INPUT
            } else {
                0
            };
            let out_pos = (self.win_dec % WINDOW_SIZE) as usize;
            let (status, consumed, produced) = decompress(
                &mut self.decomp,
                &self.input[self.input_pos..self.input_len],
                &mut self.window,
                out_pos,
                flags,
            );
            self.input_pos += consumed;
            self.win_dec += produced as u64;

            if self.win_dec > self.block_len {
                return Err(Error::Decode(format!(
                    "block produced more than the {} bytes the index declares",
                    self.block_len
                )));
            }

            match status {
                TINFLStatus::Done => {
                    if self.win_dec != self.block_len {
                        return Err(Error::Decode(format!(
                            "block produced {} bytes, index declares {}",
                            self.win_dec, self.block_len
                        )));
                    }
                    self.done = true;
                }
                TINFLStatus::NeedsMoreInput | TINFLStatus::HasMoreOutput => {}
                other => return Err(Error::Decode(tinfl_message(other).into())),
            }
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Options for [`compress_file`] / [`compress_stream`].
#[derive(Copy, Clone, Debug)]
pub struct EncodeOptions {
    /// Plaintext bytes per block.
    pub block_size: u32,
    /// DEFLATE compression level (0–10).
    pub level: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            level: 7,
        }
    }
}

/// Block-compress `input` into `<input>.idxdefl`.
///
/// The output is created exclusively; an existing file is refused rather than
/// overwritten. Returns the output path.
pub fn compress_file<P: AsRef<Path>>(input: P, options: EncodeOptions) -> Result<PathBuf> {
    let input = input.as_ref();
    let mut out_name = input.as_os_str().to_owned();
    out_name.push(".idxdefl");
    let out_path = PathBuf::from(out_name);

    let out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&out_path)?;
    let mut reader = std::fs::File::open(input)?;
    compress_stream(&mut reader, &mut BufWriter::new(out), options)?;
    Ok(out_path)
}

/// Block-compress everything from `input` into `output` as an idxdefl
/// container. Empty input is refused: the container format cannot represent
/// it (`last_block_size` must be nonzero).
pub fn compress_stream<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    options: EncodeOptions,
) -> Result<()> {
    if options.block_size == 0 {
        return Err(Error::OutOfRange("block size must be nonzero".into()));
    }
    let block_size = options.block_size as usize;

    output.write_all(&MAGIC)?;

    // One block of lookahead, so the final block can be left out of the
    // index and recorded in the footer instead.
    let mut cur = vec![0u8; block_size];
    let mut next = vec![0u8; block_size];
    let mut cur_len = read_full(input, &mut cur)?;
    if cur_len == 0 {
        return Err(Error::OutOfRange(
            "refusing to encode an empty input".into(),
        ));
    }

    let mut index = Vec::new();
    let mut full_blocks: u32 = 0;
    let last_block_size: u32;

    loop {
        let next_len = if cur_len < block_size {
            0
        } else {
            read_full(input, &mut next)?
        };

        let compressed = compress_to_vec(&cur[..cur_len], options.level);
        output.write_all(&compressed)?;

        if next_len == 0 {
            last_block_size = cur_len as u32;
            break;
        }

        let compressed_len = u32::try_from(compressed.len()).map_err(|_| {
            Error::OutOfRange("compressed block does not fit a u32 length".into())
        })?;
        index.extend_from_slice(&compressed_len.to_be_bytes());
        full_blocks = full_blocks
            .checked_add(1)
            .ok_or_else(|| Error::OutOfRange("too many blocks for the footer".into()))?;

        std::mem::swap(&mut cur, &mut next);
        cur_len = next_len;
    }

    let compressed_index = compress_to_vec(&index, options.level);
    let index_size = u32::try_from(compressed_index.len())
        .map_err(|_| Error::OutOfRange("compressed index does not fit a u32 length".into()))?;
    output.write_all(&compressed_index)?;

    for field in [index_size, options.block_size, full_blocks, last_block_size] {
        output.write_all(&field.to_be_bytes())?;
    }
    output.flush()?;

    debug!(
        blocks = full_blocks + 1,
        block_size = options.block_size,
        last_block_size,
        "wrote idxdefl container"
    );
    Ok(())
}

/// Read until `buf` is full or the input is exhausted; returns bytes read.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
