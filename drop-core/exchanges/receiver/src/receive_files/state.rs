//! Download progress of one receiving session.
//!
//! Like the sender's connection state this is a plain record changed by
//! reducer methods; the orchestrator task performs the resulting sends.

use peerdrop_common::{Chunk, FileDescriptor, Start, TransferError, TransferResult};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiverStatus {
    /// Waiting for the channel to open or for the file listing.
    Connecting,
    /// The listing arrived; nothing was requested yet.
    Listed,
    Receiving,
    Paused,
    Done,
    /// The sender reported an error or the transport failed.
    Failed,
    /// The connection closed before every file was received.
    Interrupted,
}

impl ReceiverStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Interrupted)
    }
}

impl std::fmt::Display for ReceiverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Connecting => "CONNECTING",
            Self::Listed => "LISTED",
            Self::Receiving => "RECEIVING",
            Self::Paused => "PAUSED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
        };
        f.write_str(label)
    }
}

/// What an inbound chunk means for the download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// No file is being received.
    Ignored,
    /// Bytes below the expected offset, already received.
    Duplicate,
    /// Another path, or a gap after the expected offset.
    Unexpected,
    /// Bytes appended to file `index`.
    Progress { index: usize },
    /// File `index` is complete. `next` is the request for the following
    /// file, unless the download is paused. `cancel_resend` is set when a
    /// resume request for this file may still be re-uploading it; a `Pause`
    /// must precede the next request.
    FileComplete {
        index: usize,
        next: Option<Start>,
        cancel_resend: bool,
    },
    /// The last file is complete.
    AllComplete { index: usize, cancel_resend: bool },
    /// The chunk would end the file at the wrong size.
    SizeMismatch { full_path: String, received: u64, expected: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverTransferState {
    pub status: ReceiverStatus,
    pub files_info: Option<Vec<FileDescriptor>>,
    pub current_file_index: usize,
    /// Offset within the current file the next chunk must start at.
    pub current_offset: u64,
    pub bytes_received_total: u64,
    /// First offset requested for each file, in listing order.
    pub start_offsets: Vec<u64>,
    /// A resume `Start` for the current file was sent and no `Pause` has
    /// followed it.
    pub resend_requested: bool,
    pub error: Option<String>,
}

impl Default for ReceiverTransferState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverTransferState {
    pub fn new() -> Self {
        Self {
            status: ReceiverStatus::Connecting,
            files_info: None,
            current_file_index: 0,
            current_offset: 0,
            bytes_received_total: 0,
            start_offsets: Vec::new(),
            resend_requested: false,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ReceiverStatus::Done
    }

    pub fn files(&self) -> &[FileDescriptor] {
        self.files_info.as_deref().unwrap_or_default()
    }

    pub fn current_file(&self) -> Option<&FileDescriptor> {
        self.files().get(self.current_file_index)
    }

    /// Total bytes the session will have received once done.
    pub fn bytes_expected_total(&self) -> u64 {
        self.files()
            .iter()
            .zip(self.start_offsets.iter().chain(std::iter::repeat(&0)))
            .map(|(file, offset)| file.size.saturating_sub(*offset))
            .sum()
    }

    /// Records the listing. Only the first one counts.
    pub fn on_info(&mut self, files: Vec<FileDescriptor>) -> bool {
        if self.status != ReceiverStatus::Connecting {
            return false;
        }
        self.files_info = Some(files);
        self.status = ReceiverStatus::Listed;
        true
    }

    /// Authorizes the download, resuming each file from its entry in
    /// `offsets` (missing paths start at zero). Returns the request for the
    /// first file.
    pub fn begin(&mut self, offsets: &HashMap<String, u64>) -> TransferResult<Start> {
        if self.status != ReceiverStatus::Listed {
            return Err(TransferError::InvalidState(format!(
                "cannot start a download while {}",
                self.status
            )));
        }
        let files = self.files();
        if files.is_empty() {
            return Err(TransferError::NoFiles);
        }
        if let Some(unknown) = offsets
            .keys()
            .find(|path| !files.iter().any(|f| &f.full_path == *path))
        {
            return Err(TransferError::UnknownFile(unknown.clone()));
        }

        let mut start_offsets = Vec::with_capacity(files.len());
        for file in files {
            let offset = offsets.get(&file.full_path).copied().unwrap_or(0);
            if offset > file.size {
                return Err(TransferError::InvalidOffset {
                    full_path: file.full_path.clone(),
                    offset,
                });
            }
            start_offsets.push(offset);
        }

        let first = Start {
            full_path: files[0].full_path.clone(),
            offset: start_offsets[0],
        };
        self.current_file_index = 0;
        self.current_offset = start_offsets[0];
        self.start_offsets = start_offsets;
        self.status = ReceiverStatus::Receiving;
        self.resend_requested = false;
        Ok(first)
    }

    pub fn on_chunk(&mut self, chunk: &Chunk) -> ChunkOutcome {
        if !matches!(
            self.status,
            ReceiverStatus::Receiving | ReceiverStatus::Paused
        ) {
            return ChunkOutcome::Ignored;
        }
        let Some(file) = self.current_file() else {
            return ChunkOutcome::Ignored;
        };
        if chunk.full_path != file.full_path {
            let earlier = self.files()[..self.current_file_index]
                .iter()
                .any(|f| f.full_path == chunk.full_path);
            return if earlier {
                ChunkOutcome::Duplicate
            } else {
                ChunkOutcome::Unexpected
            };
        }
        if chunk.offset < self.current_offset {
            return ChunkOutcome::Duplicate;
        }
        if chunk.offset > self.current_offset {
            return ChunkOutcome::Unexpected;
        }

        let end = chunk.end();
        if end > file.size || (chunk.is_final && end != file.size) {
            return ChunkOutcome::SizeMismatch {
                full_path: file.full_path.clone(),
                received: end,
                expected: file.size,
            };
        }

        let index = self.current_file_index;
        self.current_offset = end;
        self.bytes_received_total += chunk.bytes.len() as u64;
        if !chunk.is_final {
            return ChunkOutcome::Progress { index };
        }

        self.current_file_index += 1;
        let cancel_resend = std::mem::take(&mut self.resend_requested);
        let next = self.current_file().map(|f| f.full_path.clone());
        match next {
            Some(full_path) => {
                let offset = self.start_offsets[self.current_file_index];
                self.current_offset = offset;
                let next = (self.status == ReceiverStatus::Receiving)
                    .then_some(Start { full_path, offset });
                ChunkOutcome::FileComplete {
                    index,
                    next,
                    cancel_resend,
                }
            }
            None => {
                self.status = ReceiverStatus::Done;
                ChunkOutcome::AllComplete {
                    index,
                    cancel_resend,
                }
            }
        }
    }

    pub fn on_pause(&mut self) -> bool {
        if self.status != ReceiverStatus::Receiving {
            return false;
        }
        self.status = ReceiverStatus::Paused;
        self.resend_requested = false;
        true
    }

    /// Request that continues the current file where it left off.
    pub fn resume_request(&mut self) -> Option<Start> {
        if self.status != ReceiverStatus::Paused {
            return None;
        }
        let full_path = self.current_file()?.full_path.clone();
        self.status = ReceiverStatus::Receiving;
        self.resend_requested = true;
        Some(Start {
            full_path,
            offset: self.current_offset,
        })
    }

    /// Records a failure. The first error wins; a finished download stays
    /// finished.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_finished() {
            return;
        }
        self.status = ReceiverStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn on_close(&mut self) {
        if self.status.is_finished() {
            return;
        }
        self.status = ReceiverStatus::Interrupted;
    }
}
