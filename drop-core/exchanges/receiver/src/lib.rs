//! Receive-side library for PeerDrop transfers.
//!
//! A receiver opens one connection to a sender, presents the password,
//! learns the file listing and then downloads the files one after another.
//! Each file arrives as an [`IncomingFile`] stream that can be consumed while
//! the download is still running; [`package`] joins several of them into a
//! single tar stream.
//!
//! Typical flow:
//! 1. Build a `ReceiveFilesRequest` with a `Connection` to the sender, the
//!    password, optional device metadata and a `ReceiverConfig`.
//! 2. Call `receive_files` to obtain a `ReceiveFilesBubble`.
//! 3. Await `wait_for_listing()` and decide whether to download.
//! 4. Call `start()` (or `start_from()` to resume) and consume the streams,
//!    directly or through `package`.
//! 5. Optionally `pause()`/`resume()`, or `cancel()` to close the session.

mod package;
mod receive_files;
mod stream;

pub use package::{ArchiveStream, DownloadOutput, package};
pub use receive_files::*;
pub use stream::{IncomingFile, IncomingFileReader};

/// Tunable settings for reassembly.
///
/// `stream_buffer` is how many chunks each output stream may hold before
/// the download waits for its consumer. With the sender's default chunk size
/// each buffered chunk can be up to 10 MiB.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    pub stream_buffer: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self { stream_buffer: 4 }
    }
}
impl ReceiverConfig {
    pub fn high_performance() -> Self {
        Self { stream_buffer: 16 }
    }

    pub fn balanced() -> Self {
        Self::default()
    }

    pub fn low_bandwidth() -> Self {
        Self { stream_buffer: 2 }
    }
}
