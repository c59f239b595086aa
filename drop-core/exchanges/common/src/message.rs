//! Wire protocol spoken between a sender and its receivers.
//!
//! Every message is a JSON object discriminated by its `type` tag:
//!
//! | `type`        | Direction           | Fields                                   |
//! |---------------|---------------------|------------------------------------------|
//! | `RequestInfo` | receiver → sender   | `password`, optional device metadata     |
//! | `Info`        | sender → receiver   | `files`                                  |
//! | `Error`       | sender → receiver   | `error`                                  |
//! | `Start`       | receiver → sender   | `fullPath`, `offset`                     |
//! | `Chunk`       | sender → receiver   | `fullPath`, `offset`, `bytes`, `final`   |
//! | `Pause`       | receiver → sender   |                                          |
//! | `Done`        | receiver → sender   |                                          |
//!
//! Chunk payloads travel as standard base64 strings. Nothing here compresses
//! or encrypts; that is left to the underlying channel.

use base64::{Engine, engine::general_purpose::STANDARD};
use peerdrop_entities::File;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DecodeError, TransferError, TransferResult};

const MESSAGE_TYPES: [&str; 7] = [
    "RequestInfo",
    "Info",
    "Error",
    "Start",
    "Chunk",
    "Pause",
    "Done",
];

/// Metadata describing one published file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub full_path: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

impl From<&File> for FileDescriptor {
    fn from(file: &File) -> Self {
        Self {
            full_path: file.full_path.clone(),
            size: file.size(),
            mime_type: file.mime_type.clone(),
        }
    }
}

/// Opaque device details a receiver may attach to its first request.
///
/// The protocol never branches on these values; they exist for display.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(flatten)]
    pub metadata: PeerMetadata,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub files: Vec<FileDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Start {
    pub full_path: String,
    pub offset: u64,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub full_path: String,
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl Chunk {
    /// Offset of the first byte after this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("full_path", &self.full_path)
            .field("offset", &self.offset)
            .field("len", &self.bytes.len())
            .field("is_final", &self.is_final)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    RequestInfo(RequestInfo),
    Info(Info),
    Error(ErrorMessage),
    Start(Start),
    Chunk(Chunk),
    Pause,
    Done,
}

impl Message {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error(ErrorMessage {
            error: error.into(),
        })
    }

    /// The `type` tag this message is sent with.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestInfo(_) => "RequestInfo",
            Message::Info(_) => "Info",
            Message::Error(_) => "Error",
            Message::Start(_) => "Start",
            Message::Chunk(_) => "Chunk",
            Message::Pause => "Pause",
            Message::Done => "Done",
        }
    }

    pub fn encode(&self) -> TransferResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(TransferError::Encode)
    }

    /// Decodes one inbound payload, validating its structure.
    pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(DecodeError::Syntax)?;
        let object = value
            .as_object()
            .ok_or(DecodeError::NotAnObject)?;
        let kind = object
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(DecodeError::MissingType)?;
        if !MESSAGE_TYPES.contains(&kind) {
            return Err(DecodeError::UnknownType(kind.to_string()));
        }
        let kind = kind.to_string();
        serde_json::from_value(value)
            .map_err(|source| DecodeError::Malformed { kind, source })
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
