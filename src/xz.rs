//! XZ container support: the backward Stream Footer → Index → Stream Header
//! walk that builds the block index (tolerating concatenated streams and
//! stream padding), and a per-block decoder.
//!
//! Blocks are decoded by wrapping each one in a synthetic single-block
//! stream (reconstructed header, the block's bytes, a one-record index and a
//! footer) and feeding that through `xz4rust` incrementally. The synthetic
//! index carries the sizes the real index declared for the block, so the
//! decoder verifies them, along with the block's own integrity check.

use std::sync::Arc;

use crc32fast::Hasher;
use tracing::{debug, trace};
use xz4rust::{XzDecoder, XzNextBlockResult, DICT_SIZE_MAX, DICT_SIZE_MIN};

use crate::decode::{BlockCodec, Progress};
use crate::index::{BlockEntry, BlockIndex};
use crate::source::{ReadAt, SourceCursor};
use crate::{Error, Result, CHUNK_SIZE};

const STREAM_HEADER_SIZE: u64 = 12;
const HEADER_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
const FOOTER_MAGIC: [u8; 2] = [b'Y', b'Z'];

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Valid stream flags: first byte zero, high nibble of the second reserved.
fn check_stream_flags(flags: [u8; 2]) -> Result<[u8; 2]> {
    if flags[0] != 0 || (flags[1] & 0xF0) != 0 {
        return Err(Error::CorruptContainer(
            "reserved xz stream flag bits are set".into(),
        ));
    }
    Ok(flags)
}

fn parse_stream_header(buf: &[u8; 12]) -> Result<[u8; 2]> {
    if buf[..6] != HEADER_MAGIC {
        return Err(Error::CorruptContainer("bad xz stream header magic".into()));
    }
    let flags = check_stream_flags([buf[6], buf[7]])?;
    let stored = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
    if stored != crc32(&buf[6..8]) {
        return Err(Error::CorruptContainer("xz stream header CRC mismatch".into()));
    }
    Ok(flags)
}

/// Returns (backward size in bytes, stream flags).
fn parse_stream_footer(buf: &[u8; 12]) -> Result<(u64, [u8; 2])> {
    if buf[10..12] != FOOTER_MAGIC {
        return Err(Error::CorruptContainer("bad xz stream footer magic".into()));
    }
    let stored = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
    if stored != crc32(&buf[4..10]) {
        return Err(Error::CorruptContainer("xz stream footer CRC mismatch".into()));
    }
    let flags = check_stream_flags([buf[8], buf[9]])?;
    let backward = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
    Ok(((u64::from(backward) + 1) * 4, flags))
}

/// Unpadded block size rounded up to the 4-byte alignment blocks have inside
/// a stream.
fn padded_block_size(unpadded: u64) -> Result<u64> {
    let padding = (4 - (unpadded % 4)) % 4;
    unpadded
        .checked_add(padding)
        .ok_or_else(|| Error::CorruptContainer("xz block size overflows".into()))
}

// ── Incremental index decoder ────────────────────────────────────────────────

#[derive(PartialEq)]
enum IndexState {
    Indicator,
    CountVli,
    UnpaddedVli,
    UncompressedVli,
    Padding,
    Crc,
    Done,
}

/// Decodes the XZ Index field from a sequence of chunks. The caller feeds
/// exactly the `backward_size` bytes the footer declared; anything that does
/// not parse to a complete index in exactly that many bytes is corrupt.
struct IndexDecoder {
    size: u64,
    pos: u64,
    state: IndexState,
    vli_value: u64,
    vli_shift: u32,
    remaining_records: u64,
    pending_unpadded: u64,
    records: Vec<(u64, u64)>,
    hasher: Hasher,
    crc: [u8; 4],
    crc_len: usize,
}

impl IndexDecoder {
    fn new(size: u64) -> Self {
        Self {
            size,
            pos: 0,
            state: IndexState::Indicator,
            vli_value: 0,
            vli_shift: 0,
            remaining_records: 0,
            pending_unpadded: 0,
            records: Vec::new(),
            hasher: Hasher::new(),
            crc: [0u8; 4],
            crc_len: 0,
        }
    }

    /// Push one VLI byte; returns the decoded value once terminal.
    fn vli_byte(&mut self, byte: u8) -> Result<Option<u64>> {
        let low = u64::from(byte & 0x7F);
        if self.vli_shift >= 64 || (self.vli_shift == 63 && low > 1) {
            return Err(Error::CorruptContainer("xz index VLI overflows".into()));
        }
        self.vli_value |= low << self.vli_shift;
        if byte & 0x80 == 0 {
            let value = self.vli_value;
            self.vli_value = 0;
            self.vli_shift = 0;
            return Ok(Some(value));
        }
        self.vli_shift += 7;
        Ok(None)
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        // Everything before the trailing CRC word is covered by it.
        let crc_start = self.size.saturating_sub(4);
        if self.pos < crc_start {
            let covered = ((crc_start - self.pos) as usize).min(chunk.len());
            self.hasher.update(&chunk[..covered]);
        }

        for &byte in chunk {
            if self.pos >= self.size {
                return Err(Error::CorruptContainer("xz index is too long".into()));
            }
            loop {
                match self.state {
                    IndexState::Indicator => {
                        if byte != 0x00 {
                            return Err(Error::CorruptContainer(
                                "xz index indicator byte is missing".into(),
                            ));
                        }
                        self.state = IndexState::CountVli;
                        break;
                    }
                    IndexState::CountVli => {
                        if let Some(count) = self.vli_byte(byte)? {
                            self.remaining_records = count;
                            self.state = if count == 0 {
                                IndexState::Padding
                            } else {
                                IndexState::UnpaddedVli
                            };
                        }
                        break;
                    }
                    IndexState::UnpaddedVli => {
                        if let Some(unpadded) = self.vli_byte(byte)? {
                            if unpadded == 0 {
                                return Err(Error::CorruptContainer(
                                    "xz index lists a zero-sized block".into(),
                                ));
                            }
                            self.pending_unpadded = unpadded;
                            self.state = IndexState::UncompressedVli;
                        }
                        break;
                    }
                    IndexState::UncompressedVli => {
                        if let Some(uncompressed) = self.vli_byte(byte)? {
                            self.records.push((self.pending_unpadded, uncompressed));
                            self.remaining_records -= 1;
                            self.state = if self.remaining_records == 0 {
                                IndexState::Padding
                            } else {
                                IndexState::UnpaddedVli
                            };
                        }
                        break;
                    }
                    IndexState::Padding => {
                        if self.pos % 4 != 0 {
                            if byte != 0 {
                                return Err(Error::CorruptContainer(
                                    "nonzero xz index padding".into(),
                                ));
                            }
                            break;
                        }
                        // Aligned: this byte already belongs to the CRC.
                        self.state = IndexState::Crc;
                    }
                    IndexState::Crc => {
                        self.crc[self.crc_len] = byte;
                        self.crc_len += 1;
                        if self.crc_len == 4 {
                            let expected = u32::from_le_bytes(self.crc);
                            if expected != self.hasher.clone().finalize() {
                                return Err(Error::CorruptContainer(
                                    "xz index CRC mismatch".into(),
                                ));
                            }
                            self.state = IndexState::Done;
                        }
                        break;
                    }
                    IndexState::Done => {
                        return Err(Error::CorruptContainer(
                            "trailing bytes after the xz index".into(),
                        ));
                    }
                }
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<(u64, u64)>> {
        // A decoder still expecting input after backward_size bytes is the
        // buffer-error case: report it as corruption, not EOF.
        if self.state != IndexState::Done || self.pos != self.size {
            return Err(Error::CorruptContainer(
                "xz index ended before it was complete".into(),
            ));
        }
        Ok(self.records)
    }
}

// ── Backward stream walk ─────────────────────────────────────────────────────

/// Parse the indexes of all concatenated streams, walking backward from EOF.
/// Returns the unified block index plus the per-stream flag bytes blocks
/// need to configure their decoders.
pub(crate) fn read_index(
    source: &Arc<dyn ReadAt>,
    memlimit: u64,
) -> Result<(BlockIndex, Vec<[u8; 2]>)> {
    let size = source.size();
    let mut pos = size;
    // Streams are discovered last-first; file order is restored at the end.
    let mut streams_rev: Vec<(u64, [u8; 2], Vec<(u64, u64)>)> = Vec::new();
    let mut index_memory = 0u64;

    loop {
        if pos < 2 * STREAM_HEADER_SIZE {
            return Err(Error::CorruptContainer(
                "file too small for an xz stream".into(),
            ));
        }
        pos -= STREAM_HEADER_SIZE;

        // Stream Padding precedes the footer in multiples of 4 zero bytes.
        let mut footer = [0u8; STREAM_HEADER_SIZE as usize];
        let mut stream_padding = 0u64;
        loop {
            if pos < STREAM_HEADER_SIZE {
                return Err(Error::CorruptContainer(
                    "ran out of file while skipping stream padding".into(),
                ));
            }
            source.read_exact_at(pos, &mut footer)?;
            if footer[8..12] != [0, 0, 0, 0] {
                break;
            }
            pos -= 4;
            stream_padding += 4;
        }

        let (backward_size, footer_flags) = parse_stream_footer(&footer)?;
        if pos < backward_size + STREAM_HEADER_SIZE {
            return Err(Error::CorruptContainer(
                "xz footer declares an index larger than the preceding data".into(),
            ));
        }
        let index_start = pos - backward_size;

        let mut decoder = IndexDecoder::new(backward_size);
        let mut cursor = SourceCursor::new(Arc::clone(source));
        cursor.seek(index_start, Some(backward_size));
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = cursor.read_chunk(&mut chunk)?;
            if n == 0 {
                break;
            }
            decoder.feed(&chunk[..n])?;
        }
        let records = decoder.finish()?;

        index_memory += records.len() as u64 * BlockIndex::ENTRY_COST;
        if index_memory > memlimit {
            return Err(Error::ResourceLimit(format!(
                "xz block index exceeds the {memlimit}-byte memory budget"
            )));
        }

        let mut blocks_size = 0u64;
        for &(unpadded, _) in &records {
            blocks_size = blocks_size
                .checked_add(padded_block_size(unpadded)?)
                .ok_or_else(|| Error::CorruptContainer("xz stream size overflows".into()))?;
        }
        if index_start < blocks_size + STREAM_HEADER_SIZE {
            return Err(Error::CorruptContainer(
                "xz index records reach before the start of the stream".into(),
            ));
        }
        pos = index_start - blocks_size - STREAM_HEADER_SIZE;

        let mut header = [0u8; STREAM_HEADER_SIZE as usize];
        source.read_exact_at(pos, &mut header)?;
        let header_flags = parse_stream_header(&header)?;
        if header_flags != footer_flags {
            return Err(Error::CorruptContainer(
                "xz stream header and footer flags disagree".into(),
            ));
        }

        trace!(
            stream_start = pos,
            blocks = records.len(),
            stream_padding,
            "parsed xz stream index"
        );
        streams_rev.push((pos, footer_flags, records));

        if pos == 0 {
            break;
        }
    }

    let mut entries = Vec::new();
    let mut flags_table = Vec::with_capacity(streams_rev.len());
    let mut uncompressed_offset = 0u64;
    for (stream_start, flags, records) in streams_rev.into_iter().rev() {
        let stream = flags_table.len() as u32;
        flags_table.push(flags);
        let mut compressed_offset = stream_start + STREAM_HEADER_SIZE;
        for (unpadded, uncompressed) in records {
            entries.push(BlockEntry {
                uncompressed_offset,
                uncompressed_len: uncompressed,
                compressed_offset,
                compressed_len: unpadded,
                stream,
            });
            uncompressed_offset = uncompressed_offset
                .checked_add(uncompressed)
                .ok_or_else(|| Error::CorruptContainer("uncompressed size overflows".into()))?;
            compressed_offset += padded_block_size(unpadded)?;
        }
    }

    debug!(
        streams = flags_table.len(),
        blocks = entries.len(),
        uncompressed_size = uncompressed_offset,
        "parsed xz container"
    );
    let index = BlockIndex::new(entries)?;
    Ok((index, flags_table))
}

// ── Synthetic single-block stream ────────────────────────────────────────────

fn encode_vli(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn build_stream_header(flags: [u8; 2]) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[..6].copy_from_slice(&HEADER_MAGIC);
    header[6..8].copy_from_slice(&flags);
    header[8..12].copy_from_slice(&crc32(&flags).to_le_bytes());
    header
}

/// Everything that follows one block's bytes in a synthetic single-block
/// stream: block padding, a one-record index, and the stream footer.
fn build_block_trailer(flags: [u8; 2], unpadded: u64, uncompressed: u64) -> Vec<u8> {
    let padding = ((4 - (unpadded % 4)) % 4) as usize;

    let mut index = vec![0x00];
    encode_vli(1, &mut index);
    encode_vli(unpadded, &mut index);
    encode_vli(uncompressed, &mut index);
    while index.len() % 4 != 0 {
        index.push(0);
    }
    let index_crc = crc32(&index);
    index.extend_from_slice(&index_crc.to_le_bytes());

    let mut footer = [0u8; 12];
    let backward = (index.len() / 4 - 1) as u32;
    footer[4..8].copy_from_slice(&backward.to_le_bytes());
    footer[8..10].copy_from_slice(&flags);
    footer[10..12].copy_from_slice(&FOOTER_MAGIC);
    let footer_crc = crc32(&footer[4..10]);
    footer[..4].copy_from_slice(&footer_crc.to_le_bytes());

    let mut trailer = Vec::with_capacity(padding + index.len() + 12);
    trailer.resize(padding, 0);
    trailer.extend_from_slice(&index);
    trailer.extend_from_slice(&footer);
    trailer
}

// ── Block codec ──────────────────────────────────────────────────────────────

enum Stage {
    Prelude,
    Body,
    Trailer,
}

/// Per-block XZ decoder. Each block becomes its own synthetic stream, so the
/// decoder is torn down and rebuilt at every block boundary, exactly like
/// the per-block filter chains it replaces.
pub(crate) struct XzBlockCodec {
    streams: Arc<Vec<[u8; 2]>>,
    decoder: XzDecoder<'static>,
    prelude: [u8; 12],
    prelude_fed: usize,
    trailer: Vec<u8>,
    trailer_fed: usize,
    stage: Stage,
    input: Box<[u8; CHUNK_SIZE]>,
    input_pos: usize,
    input_len: usize,
    produced: u64,
    block_len: u64,
}

impl XzBlockCodec {
    pub fn new(streams: Arc<Vec<[u8; 2]>>) -> Self {
        Self {
            streams,
            decoder: XzDecoder::with_alloc_dict_size(DICT_SIZE_MIN, DICT_SIZE_MAX),
            prelude: [0u8; 12],
            prelude_fed: 0,
            trailer: Vec::new(),
            trailer_fed: 0,
            stage: Stage::Trailer,
            input: Box::new([0u8; CHUNK_SIZE]),
            input_pos: 0,
            input_len: 0,
            produced: 0,
            block_len: 0,
        }
    }

    /// Block-header failures are container corruption; anything after output
    /// has started flowing is a data error inside the block.
    fn classify(&self, err: impl std::fmt::Display) -> Error {
        if self.produced == 0 {
            Error::CorruptContainer(format!("xz block header rejected: {err}"))
        } else {
            Error::Decode(format!("xz block data rejected: {err}"))
        }
    }
}

impl BlockCodec for XzBlockCodec {
    fn begin_block(&mut self, cursor: &mut SourceCursor, entry: &BlockEntry) -> Result<()> {
        cursor.seek(entry.compressed_offset, Some(entry.compressed_len));
        if cursor.remaining() != entry.compressed_len {
            return Err(Error::UnexpectedEof(
                "file is truncated inside an xz block".into(),
            ));
        }

        let flags = *self
            .streams
            .get(entry.stream as usize)
            .expect("stream ordinal from the same index");

        // Prime the input buffer so the block header descriptor can be
        // sanity-checked before the decoder sees anything.
        self.input_pos = 0;
        self.input_len = cursor.read_chunk(&mut self.input[..])?;
        if self.input_len == 0 {
            return Err(Error::UnexpectedEof(
                "end of file while reading an xz block header".into(),
            ));
        }
        let descriptor = self.input[0];
        if descriptor == 0 {
            return Err(Error::CorruptContainer(
                "expected an xz block header, found the index".into(),
            ));
        }
        let header_size = (u64::from(descriptor) + 1) * 4;
        if header_size > entry.compressed_len {
            return Err(Error::CorruptContainer(
                "xz block header is larger than the block".into(),
            ));
        }

        self.prelude = build_stream_header(flags);
        self.prelude_fed = 0;
        self.trailer = build_block_trailer(flags, entry.compressed_len, entry.uncompressed_len);
        self.trailer_fed = 0;
        self.stage = Stage::Prelude;
        self.produced = 0;
        self.block_len = entry.uncompressed_len;
        self.decoder = XzDecoder::with_alloc_dict_size(DICT_SIZE_MIN, DICT_SIZE_MAX);
        Ok(())
    }

    fn decode(&mut self, cursor: &mut SourceCursor, out: &mut [u8]) -> Result<Progress> {
        loop {
            let segment: &[u8] = match self.stage {
                Stage::Prelude => &self.prelude[self.prelude_fed..],
                Stage::Body => {
                    if self.input_pos >= self.input_len {
                        self.input_pos = 0;
                        self.input_len = cursor.read_chunk(&mut self.input[..])?;
                        if self.input_len == 0 {
                            self.stage = Stage::Trailer;
                            continue;
                        }
                    }
                    &self.input[self.input_pos..self.input_len]
                }
                Stage::Trailer => {
                    let rest = &self.trailer[self.trailer_fed..];
                    if rest.is_empty() {
                        return Err(self.classify("decoder wanted data past the block's end"));
                    }
                    rest
                }
            };

            let result = self
                .decoder
                .decode(segment, out)
                .map_err(|e| self.classify(e))?;
            let consumed = result.input_consumed();
            let produced = result.output_produced();

            match self.stage {
                Stage::Prelude => {
                    self.prelude_fed += consumed;
                    if self.prelude_fed == self.prelude.len() {
                        self.stage = Stage::Body;
                    }
                }
                Stage::Body => self.input_pos += consumed,
                Stage::Trailer => self.trailer_fed += consumed,
            }
            self.produced += produced as u64;
            if self.produced > self.block_len {
                return Err(Error::Decode(format!(
                    "block produced more than the {} bytes the index declares",
                    self.block_len
                )));
            }

            match result {
                XzNextBlockResult::EndOfStream(_, _) => {
                    return Ok(Progress::EndOfBlock(produced))
                }
                XzNextBlockResult::NeedMoreData(_, _) => {
                    if produced > 0 {
                        return Ok(Progress::Produced(produced));
                    }
                    if consumed == 0 {
                        return Err(self.classify("decoder made no progress"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vli_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 0x1234_5678, u64::MAX / 2] {
            let mut bytes = Vec::new();
            encode_vli(value, &mut bytes);

            let mut decoder = IndexDecoder::new(u64::MAX);
            decoder.state = IndexState::CountVli;
            let mut decoded = None;
            for &b in &bytes {
                decoded = decoder.vli_byte(b).unwrap();
            }
            assert_eq!(decoded, Some(value));
        }
    }

    #[test]
    fn synthetic_trailer_is_well_formed() {
        let flags = [0x00, 0x01]; // CRC32 check
        let trailer = build_block_trailer(flags, 30, 100);

        // 2 bytes of block padding to reach alignment.
        assert_eq!(&trailer[..2], &[0, 0]);
        // Index indicator follows the padding.
        assert_eq!(trailer[2], 0x00);
        // Footer magic closes the stream.
        assert_eq!(&trailer[trailer.len() - 2..], &FOOTER_MAGIC);

        // The footer must itself parse.
        let footer: [u8; 12] = trailer[trailer.len() - 12..].try_into().unwrap();
        let (backward, parsed_flags) = parse_stream_footer(&footer).unwrap();
        assert_eq!(parsed_flags, flags);
        assert_eq!(backward as usize, trailer.len() - 2 - 12);
    }

    #[test]
    fn synthetic_header_matches_parser() {
        let header = build_stream_header([0x00, 0x04]);
        assert_eq!(parse_stream_header(&header).unwrap(), [0x00, 0x04]);
    }

    #[test]
    fn index_decoder_parses_a_two_record_index() {
        let mut index = vec![0x00];
        encode_vli(2, &mut index);
        encode_vli(0x2F, &mut index);
        encode_vli(0x1000, &mut index);
        encode_vli(0x33, &mut index);
        encode_vli(0x800, &mut index);
        while index.len() % 4 != 0 {
            index.push(0);
        }
        let crc = crc32(&index);
        index.extend_from_slice(&crc.to_le_bytes());

        let mut decoder = IndexDecoder::new(index.len() as u64);
        // Feed in deliberately awkward chunk sizes.
        for chunk in index.chunks(3) {
            decoder.feed(chunk).unwrap();
        }
        let records = decoder.finish().unwrap();
        assert_eq!(records, vec![(0x2F, 0x1000), (0x33, 0x800)]);
    }

    #[test]
    fn index_decoder_rejects_bad_crc() {
        let mut index = vec![0x00];
        encode_vli(1, &mut index);
        encode_vli(0x2F, &mut index);
        encode_vli(0x1000, &mut index);
        while index.len() % 4 != 0 {
            index.push(0);
        }
        let crc = crc32(&index) ^ 1;
        index.extend_from_slice(&crc.to_le_bytes());

        let mut decoder = IndexDecoder::new(index.len() as u64);
        let err = decoder.feed(&index).unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }

    #[test]
    fn truncated_index_is_corrupt_not_eof() {
        let mut index = vec![0x00];
        encode_vli(1, &mut index);
        encode_vli(0x2F, &mut index);

        let mut decoder = IndexDecoder::new(index.len() as u64);
        decoder.feed(&index).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(Error::CorruptContainer(_))
        ));
    }
}
