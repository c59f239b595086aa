//! Chunk scheduling for a single in-flight file.
//!
//! The scheduler is a pure function of `(size, offset)`: the caller keeps the
//! current offset and feeds each returned `end` back in as the next offset.

use crate::error::{TransferError, TransferResult};

/// Largest number of file bytes carried by a single chunk.
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Half-open byte range `[start, end)` of the next chunk to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    pub is_final: bool,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Returns the range to send next for a file of `size` bytes whose receiver
/// has everything before `offset`.
///
/// `offset == size` is valid and yields an empty final range, which is how
/// empty files (and fully received files) are terminated.
pub fn next_chunk(
    size: u64,
    offset: u64,
    max_chunk_size: u64,
) -> TransferResult<ChunkRange> {
    if offset > size {
        return Err(TransferError::InvalidOffset {
            full_path: String::new(),
            offset,
        });
    }
    let end = offset
        .saturating_add(max_chunk_size.max(1))
        .min(size);
    Ok(ChunkRange {
        start: offset,
        end,
        is_final: end == size,
    })
}

/// Iterates over every range `next_chunk` would produce from `offset` on.
pub fn chunk_ranges(
    size: u64,
    offset: u64,
    max_chunk_size: u64,
) -> ChunkRanges {
    ChunkRanges {
        size,
        offset: (offset <= size).then_some(offset),
        max_chunk_size,
    }
}

#[derive(Clone, Debug)]
pub struct ChunkRanges {
    size: u64,
    offset: Option<u64>,
    max_chunk_size: u64,
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        let offset = self.offset?;
        let range = next_chunk(self.size, offset, self.max_chunk_size).ok()?;
        self.offset = (!range.is_final).then_some(range.end);
        Some(range)
    }
}
