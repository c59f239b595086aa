//! Send-side library for PeerDrop transfers.
//!
//! A sender publishes a fixed set of files behind an optional password and
//! serves any number of receivers concurrently. Every inbound connection is
//! driven by its own state machine:
//!
//! ```text
//! Pending --RequestInfo(ok)--> Paused --Start--> Uploading --final--> Paused
//!    |                           |  ^               |
//!    |                           |  +----Pause------+
//!    +--RequestInfo(bad)--> InvalidPassword        Done <--Done-- Paused
//! ```
//!
//! Any state except `InvalidPassword` and `Done` becomes `Closed` when the
//! connection closes.
//!
//! Typical flow:
//! 1. Build a `SendFilesRequest` with the files, password and `SenderConfig`.
//! 2. Call `send_files` to obtain a `SendFilesBubble`.
//! 3. Hand every inbound `Connection` from your transport to
//!    `SendFilesBubble::accept`.
//! 4. Observe progress through `subscribe` or `connections()`.

mod send_files;

use peerdrop_common::MAX_CHUNK_SIZE;

pub use peerdrop_entities::{Data, File, MemoryData};
pub use send_files::*;

/// Tunable settings for chunk production.
///
/// - `chunk_size` is the largest number of file bytes put in one chunk. It
///   is capped at [`MAX_CHUNK_SIZE`].
/// - `buffer_size` is how many bytes may sit in a channel's outbound buffer
///   before the next chunk is held back.
#[derive(Clone, Debug)]
pub struct SenderConfig {
    pub chunk_size: u64,
    pub buffer_size: u64,
}
impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE, // 10MB chunks
            buffer_size: 16 * 1024 * 1024, // 16MB buffer
        }
    }
}
impl SenderConfig {
    pub fn high_performance() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            buffer_size: 64 * 1024 * 1024,
        }
    }

    pub fn balanced() -> Self {
        Self::default()
    }

    pub fn low_bandwidth() -> Self {
        Self {
            chunk_size: 64 * 1024,   // 64KB chunks
            buffer_size: 256 * 1024, // 256KB buffer
        }
    }

    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }
}
