//! Core data abstraction for byte-oriented, read-only sources.
//!
//! This module defines the `Data` trait, which models a thread-safe source of
//! bytes with a fixed length that can be read at arbitrary offsets. Typical
//! implementors include in-memory buffers and files on disk.
//!
//! Concurrency notes:
//! - All methods take `&self`, and the trait is `Send + Sync`, so implementors
//!   that keep file handles or cursors must synchronize internally.
//! - Reads are positioned, not consuming: reading a range twice returns the
//!   same bytes. This is what lets a sender serve several receivers, and
//!   restart a file at any offset, from the same source.

use std::io;

/// A thread-safe, random-access source of bytes.
///
/// Contract:
/// - `len()` returns the total length in bytes and never changes over the
///   lifetime of the object.
/// - `read_at(offset, len)` returns exactly `len` bytes starting at `offset`
///   when `offset + len <= self.len()`. Requests past the end are clamped;
///   an `offset` beyond the end yields an empty vector.
pub trait Data: Send + Sync {
    /// Total length of the data in bytes.
    fn len(&self) -> u64;

    /// Checks if the data is empty (length is 0).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `len` bytes starting at `offset`.
    ///
    /// Implementations may block (e.g. on disk I/O); async callers should
    /// run this on a blocking thread.
    fn read_at(&self, offset: u64, len: u64) -> io::Result<Vec<u8>>;
}

/// `Data` backed by an owned byte buffer.
#[derive(Clone, Default)]
pub struct MemoryData {
    bytes: Vec<u8>,
}

impl MemoryData {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for MemoryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryData")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Data for MemoryData {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let total = self.bytes.len() as u64;
        let start = offset.min(total);
        let end = offset.saturating_add(len).min(total);
        Ok(self.bytes[start as usize..end as usize].to_vec())
    }
}
