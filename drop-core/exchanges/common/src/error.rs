use thiserror::Error;

pub type TransferResult<T> = Result<T, TransferError>;

/// Failure to turn an inbound payload into a [`crate::Message`].
///
/// Decode errors are local to a single message: callers log them, drop the
/// payload and keep the connection open.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no `type` tag")]
    MissingType,
    #[error("unrecognized message type `{0}`")]
    UnknownType(String),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid password")]
    InvalidPassword,
    #[error("invalid file offset {offset} for {full_path}")]
    InvalidOffset { full_path: String, offset: u64 },
    #[error("unknown file {0}")]
    UnknownFile(String),
    #[error("no files to download")]
    NoFiles,
    #[error("duplicate file path {0}")]
    DuplicatePath(String),
    #[error("{0}")]
    Remote(String),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Peer(String),
    #[error("transfer of {0} was interrupted")]
    Interrupted(String),
    #[error("{full_path} ended at {received} bytes, expected {expected}")]
    SizeMismatch {
        full_path: String,
        received: u64,
        expected: u64,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

const UNREACHABLE_PEER_PREFIX: &str = "could not connect to peer";

/// Rewrites transport error text into the string shown to a person.
///
/// Most messages pass through untouched. The transport's "could not connect
/// to peer ..." family is replaced by a clearer explanation.
pub fn clean_error_message(message: &str) -> String {
    let is_unreachable = message
        .get(..UNREACHABLE_PEER_PREFIX.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(UNREACHABLE_PEER_PREFIX))
        .unwrap_or(false);
    if is_unreachable {
        return String::from(
            "Could not connect to the sender. Did they close their session?",
        );
    }
    message.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_unreachable_peer_messages() {
        assert_eq!(
            clean_error_message("Could not connect to peer abc-123"),
            "Could not connect to the sender. Did they close their session?"
        );
        assert_eq!(
            clean_error_message("could not connect to peer 127.0.0.1:9"),
            "Could not connect to the sender. Did they close their session?"
        );
    }

    #[test]
    fn keeps_other_messages() {
        assert_eq!(clean_error_message("Invalid password"), "Invalid password");
        assert_eq!(clean_error_message(""), "");
        // Multi-byte text shorter than the prefix must not panic.
        assert_eq!(clean_error_message("ошибка"), "ошибка");
    }
}
