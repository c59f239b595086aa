//! Per-connection admission and upload state.
//!
//! `SenderConnectionState` is a plain record mutated through reducer-style
//! methods. Each method applies one protocol input and returns the side
//! effects the driver must perform; none of them touch the transport.

use peerdrop_common::{
    ChunkRange, FileDescriptor, Message, PeerMetadata, RequestInfo, Start,
    TransferError, TransferResult,
};

pub const INVALID_PASSWORD_MESSAGE: &str = "Invalid password";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SenderConnectionStatus {
    Pending,
    Paused,
    Uploading,
    Done,
    InvalidPassword,
    Closed,
}

impl SenderConnectionStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::InvalidPassword | Self::Closed)
    }
}

impl std::fmt::Display for SenderConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Paused => "PAUSED",
            Self::Uploading => "UPLOADING",
            Self::Done => "DONE",
            Self::InvalidPassword => "INVALID_PASSWORD",
            Self::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

/// Side effect requested by a state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderAction {
    Send(Message),
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderConnectionState {
    pub status: SenderConnectionStatus,
    pub uploading_full_path: Option<String>,
    pub uploading_offset: Option<u64>,
    pub metadata: Option<PeerMetadata>,
}

impl Default for SenderConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderConnectionState {
    pub fn new() -> Self {
        Self {
            status: SenderConnectionStatus::Pending,
            uploading_full_path: None,
            uploading_offset: None,
            metadata: None,
        }
    }

    /// Password gate. Only the first request of a connection is answered.
    pub fn on_request_info(
        &mut self,
        request: RequestInfo,
        expected_password: &str,
        files: &[FileDescriptor],
    ) -> Vec<SenderAction> {
        if self.status != SenderConnectionStatus::Pending {
            return Vec::new();
        }
        self.metadata = Some(request.metadata);

        if request.password != expected_password {
            self.status = SenderConnectionStatus::InvalidPassword;
            return vec![
                SenderAction::Send(Message::error(INVALID_PASSWORD_MESSAGE)),
                SenderAction::Close,
            ];
        }

        self.status = SenderConnectionStatus::Paused;
        vec![SenderAction::Send(Message::Info(peerdrop_common::Info {
            files: files.to_vec(),
        }))]
    }

    /// Begins uploading `start.full_path` at `start.offset`.
    ///
    /// Returns `Ok(false)` when the request is ignored because no file may
    /// start in the current state. Unknown paths and offsets past the end
    /// are rejected without changing state.
    pub fn on_start(
        &mut self,
        start: Start,
        files: &[FileDescriptor],
    ) -> TransferResult<bool> {
        if self.status != SenderConnectionStatus::Paused {
            return Ok(false);
        }
        let file = files
            .iter()
            .find(|f| f.full_path == start.full_path)
            .ok_or_else(|| TransferError::UnknownFile(start.full_path.clone()))?;
        if start.offset > file.size {
            return Err(TransferError::InvalidOffset {
                full_path: start.full_path,
                offset: start.offset,
            });
        }

        self.status = SenderConnectionStatus::Uploading;
        self.uploading_full_path = Some(start.full_path);
        self.uploading_offset = Some(start.offset);
        Ok(true)
    }

    /// Stops the current upload. Returns whether anything was paused.
    pub fn on_pause(&mut self) -> bool {
        if self.status != SenderConnectionStatus::Uploading {
            return false;
        }
        self.status = SenderConnectionStatus::Paused;
        true
    }

    pub fn on_done(&mut self) -> Vec<SenderAction> {
        if self.status != SenderConnectionStatus::Paused {
            return Vec::new();
        }
        self.status = SenderConnectionStatus::Done;
        vec![SenderAction::Close]
    }

    /// Records the end of the connection. Terminal outcomes are preserved.
    pub fn on_close(&mut self) {
        if matches!(
            self.status,
            SenderConnectionStatus::InvalidPassword
                | SenderConnectionStatus::Done
        ) {
            return;
        }
        self.status = SenderConnectionStatus::Closed;
    }

    /// The file and offset the next chunk must be cut from, while uploading.
    pub fn upload_position(&self) -> Option<(&str, u64)> {
        if self.status != SenderConnectionStatus::Uploading {
            return None;
        }
        Some((
            self.uploading_full_path.as_deref()?,
            self.uploading_offset?,
        ))
    }

    pub fn on_chunk_sent(&mut self, range: ChunkRange) {
        if self.status != SenderConnectionStatus::Uploading {
            return;
        }
        self.uploading_offset = Some(range.end);
        if range.is_final {
            self.status = SenderConnectionStatus::Paused;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn files() -> Vec<FileDescriptor> {
        vec![
            FileDescriptor {
                full_path: "/a.txt".into(),
                size: 25 * 1024 * 1024,
                mime_type: "text/plain".into(),
            },
            FileDescriptor {
                full_path: "/empty".into(),
                size: 0,
                mime_type: "application/octet-stream".into(),
            },
        ]
    }

    fn request(password: &str) -> RequestInfo {
        RequestInfo {
            metadata: PeerMetadata {
                browser_name: Some("Firefox".into()),
                ..Default::default()
            },
            password: password.into(),
        }
    }

    fn start(full_path: &str, offset: u64) -> Start {
        Start {
            full_path: full_path.into(),
            offset,
        }
    }

    fn paused() -> SenderConnectionState {
        let mut state = SenderConnectionState::new();
        state.on_request_info(request("secret"), "secret", &files());
        state
    }

    #[test]
    fn correct_password_sends_info_once() {
        let mut state = SenderConnectionState::new();
        let actions = state.on_request_info(request("secret"), "secret", &files());

        assert_eq!(state.status, SenderConnectionStatus::Paused);
        assert_eq!(
            actions,
            vec![SenderAction::Send(Message::Info(peerdrop_common::Info {
                files: files()
            }))]
        );
        assert_eq!(
            state.metadata.as_ref().and_then(|m| m.browser_name.as_deref()),
            Some("Firefox")
        );

        for _ in 0..3 {
            assert!(
                state
                    .on_request_info(request("secret"), "secret", &files())
                    .is_empty()
            );
        }
        assert_eq!(state.status, SenderConnectionStatus::Paused);
    }

    #[rstest]
    #[case("")]
    #[case("Secret")]
    #[case("secret ")]
    #[case("wrong")]
    fn wrong_password_sends_one_error_and_closes(#[case] password: &str) {
        let mut state = SenderConnectionState::new();
        let actions = state.on_request_info(request(password), "secret", &files());

        assert_eq!(state.status, SenderConnectionStatus::InvalidPassword);
        assert_eq!(
            actions,
            vec![
                SenderAction::Send(Message::error(INVALID_PASSWORD_MESSAGE)),
                SenderAction::Close,
            ]
        );
        // A retry on the same connection is not answered.
        assert!(
            state
                .on_request_info(request("secret"), "secret", &files())
                .is_empty()
        );
        assert_eq!(state.status, SenderConnectionStatus::InvalidPassword);
    }

    #[test]
    fn start_requires_paused() {
        let mut state = SenderConnectionState::new();
        assert!(!state.on_start(start("/a.txt", 0), &files()).unwrap());
        assert_eq!(state.status, SenderConnectionStatus::Pending);

        let mut state = paused();
        assert!(state.on_start(start("/a.txt", 0), &files()).unwrap());
        assert_eq!(state.status, SenderConnectionStatus::Uploading);
        assert_eq!(state.upload_position(), Some(("/a.txt", 0)));

        // A second Start while uploading is ignored.
        assert!(!state.on_start(start("/empty", 0), &files()).unwrap());
        assert_eq!(state.upload_position(), Some(("/a.txt", 0)));
    }

    #[test]
    fn start_validates_path_and_offset() {
        let mut state = paused();
        assert!(matches!(
            state.on_start(start("/missing", 0), &files()),
            Err(TransferError::UnknownFile(path)) if path == "/missing"
        ));
        assert!(matches!(
            state.on_start(start("/empty", 1), &files()),
            Err(TransferError::InvalidOffset { offset: 1, .. })
        ));
        assert_eq!(state.status, SenderConnectionStatus::Paused);

        // Offset equal to the size is allowed.
        assert!(state.on_start(start("/empty", 0), &files()).unwrap());
    }

    #[test]
    fn final_chunk_returns_to_paused() {
        let mut state = paused();
        state.on_start(start("/a.txt", 0), &files()).unwrap();

        state.on_chunk_sent(ChunkRange {
            start: 0,
            end: 10,
            is_final: false,
        });
        assert_eq!(state.upload_position(), Some(("/a.txt", 10)));

        state.on_chunk_sent(ChunkRange {
            start: 10,
            end: 25 * 1024 * 1024,
            is_final: true,
        });
        assert_eq!(state.status, SenderConnectionStatus::Paused);
        assert_eq!(state.upload_position(), None);
        assert_eq!(state.uploading_offset, Some(25 * 1024 * 1024));
    }

    #[test]
    fn pause_only_applies_while_uploading() {
        let mut state = paused();
        assert!(!state.on_pause());

        state.on_start(start("/a.txt", 5), &files()).unwrap();
        assert!(state.on_pause());
        assert_eq!(state.status, SenderConnectionStatus::Paused);
        assert_eq!(state.upload_position(), None);

        // Chunks racing the pause do not move the offset.
        state.on_chunk_sent(ChunkRange {
            start: 5,
            end: 10,
            is_final: false,
        });
        assert_eq!(state.uploading_offset, Some(5));
    }

    #[test]
    fn done_closes_from_paused_only() {
        let mut state = SenderConnectionState::new();
        assert!(state.on_done().is_empty());

        let mut state = paused();
        state.on_start(start("/a.txt", 0), &files()).unwrap();
        assert!(state.on_done().is_empty());
        assert_eq!(state.status, SenderConnectionStatus::Uploading);

        state.on_pause();
        assert_eq!(state.on_done(), vec![SenderAction::Close]);
        assert_eq!(state.status, SenderConnectionStatus::Done);
    }

    #[rstest]
    #[case(SenderConnectionStatus::Pending, SenderConnectionStatus::Closed)]
    #[case(SenderConnectionStatus::Paused, SenderConnectionStatus::Closed)]
    #[case(SenderConnectionStatus::Uploading, SenderConnectionStatus::Closed)]
    #[case(SenderConnectionStatus::Closed, SenderConnectionStatus::Closed)]
    #[case(SenderConnectionStatus::Done, SenderConnectionStatus::Done)]
    #[case(
        SenderConnectionStatus::InvalidPassword,
        SenderConnectionStatus::InvalidPassword
    )]
    fn close_preserves_terminal_outcomes(
        #[case] before: SenderConnectionStatus,
        #[case] after: SenderConnectionStatus,
    ) {
        let mut state = SenderConnectionState {
            status: before,
            ..SenderConnectionState::new()
        };
        state.on_close();
        assert_eq!(state.status, after);
    }
}
