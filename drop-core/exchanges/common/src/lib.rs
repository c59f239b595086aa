//! Shared protocol pieces for PeerDrop exchanges.
//!
//! - [`message`]: the wire messages and their codec.
//! - [`chunk`]: the stateless chunk scheduler.
//! - [`channel`]: the data channel abstraction both peers talk through, and
//!   [`memory`] for an in-process implementation.
//! - [`error`]: the error taxonomy shared by sender and receiver.

pub mod channel;
pub mod chunk;
pub mod error;
pub mod memory;
pub mod message;

pub use channel::{ChannelEvent, Connection, DataChannel, send_message};
pub use chunk::{ChunkRange, MAX_CHUNK_SIZE, chunk_ranges, next_chunk};
pub use error::{
    DecodeError, TransferError, TransferResult, clean_error_message,
};
pub use message::{
    Chunk, ErrorMessage, FileDescriptor, Info, Message, PeerMetadata,
    RequestInfo, Start,
};
