//! The unified block index both container formats decode into: an ordered,
//! gap-free mapping from uncompressed ranges to compressed ranges.

use crate::{Error, Result};

/// One independently decompressible block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockEntry {
    /// Start of the block in the decoded stream.
    pub uncompressed_offset: u64,
    /// Decoded size of the block.
    pub uncompressed_len: u64,
    /// Start of the block in the file.
    pub compressed_offset: u64,
    /// XZ: unpadded block size. idxdefl: distance to the next block.
    pub compressed_len: u64,
    /// Ordinal of the owning XZ Stream (0 for idxdefl).
    pub stream: u32,
}

/// Ordered block table covering the uncompressed space `[0, size)` with no
/// gaps or overlap. Immutable once built; shared by every reader of an
/// archive.
#[derive(Debug)]
pub(crate) struct BlockIndex {
    entries: Vec<BlockEntry>,
    uncompressed_size: u64,
}

impl BlockIndex {
    /// Estimated index memory per block, used against the open memlimit.
    pub const ENTRY_COST: u64 = std::mem::size_of::<BlockEntry>() as u64;

    pub fn new(entries: Vec<BlockEntry>) -> Result<Self> {
        let mut expected_uoff = 0u64;
        let mut min_coff = 0u64;
        for (i, e) in entries.iter().enumerate() {
            if e.uncompressed_offset != expected_uoff {
                return Err(Error::CorruptContainer(format!(
                    "block {i} starts at uncompressed offset {} instead of {expected_uoff}",
                    e.uncompressed_offset
                )));
            }
            if e.compressed_offset < min_coff {
                return Err(Error::CorruptContainer(format!(
                    "block {i} overlaps the previous block's compressed data"
                )));
            }
            expected_uoff = expected_uoff
                .checked_add(e.uncompressed_len)
                .ok_or_else(|| Error::CorruptContainer("uncompressed size overflow".into()))?;
            min_coff = e
                .compressed_offset
                .checked_add(e.compressed_len)
                .ok_or_else(|| Error::CorruptContainer("compressed offset overflow".into()))?;
        }

        Ok(Self {
            entries,
            uncompressed_size: expected_uoff,
        })
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, ordinal: usize) -> &BlockEntry {
        &self.entries[ordinal]
    }

    /// Ordinal of the block containing uncompressed offset `uoff`, or `None`
    /// past the end.
    pub fn locate(&self, uoff: u64) -> Option<usize> {
        if uoff >= self.uncompressed_size {
            return None;
        }
        let ordinal = self
            .entries
            .partition_point(|e| e.uncompressed_offset + e.uncompressed_len <= uoff);
        debug_assert!(ordinal < self.entries.len());
        Some(ordinal)
    }

    /// Ordinal after `ordinal`, or `None` past the last block.
    pub fn next(&self, ordinal: usize) -> Option<usize> {
        let next = ordinal + 1;
        (next < self.entries.len()).then_some(next)
    }
}
