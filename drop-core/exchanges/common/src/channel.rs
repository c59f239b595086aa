//! Abstraction over the ordered, reliable data channel between two peers.
//!
//! The protocol layer owns no transport internals. It sends whole messages
//! through a [`DataChannel`] and consumes a stream of [`ChannelEvent`]s.
//! Transports (WebRTC data channels, TCP sockets, in-process pipes) adapt to
//! this shape; see [`crate::memory`] for the in-process one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::Message;

/// Lifecycle and data events observed on a channel, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is ready to carry messages.
    Open,
    /// One complete inbound payload.
    Data(Vec<u8>),
    /// A channel-level failure (open, send or receive).
    Error(String),
    /// A fatal failure of the local peer/transport rather than this channel.
    PeerError(String),
    /// The channel closed. No further events follow.
    Close,
}

/// Outbound half of a connection.
pub trait DataChannel: Send + Sync {
    /// Identifier assigned by the transport.
    fn id(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Queues one payload. Fire-and-forget: does nothing once the channel
    /// is closed.
    fn send(&self, payload: Vec<u8>);

    /// Closes the channel. Idempotent.
    fn close(&self);

    /// Bytes accepted by `send` but not yet handed to the network.
    fn buffered_amount(&self) -> u64 {
        0
    }
}

/// A data channel together with its inbound event stream.
pub struct Connection {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Connection {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { channel, events }
    }

    pub fn id(&self) -> &str {
        self.channel.id()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.channel.id())
            .field("is_open", &self.channel.is_open())
            .finish()
    }
}

/// Encodes and sends `message`, logging instead of failing.
///
/// Returns whether the message was handed to an open channel.
pub fn send_message(channel: &dyn DataChannel, message: &Message) -> bool {
    if !channel.is_open() {
        return false;
    }
    match message.encode() {
        Ok(payload) => {
            channel.send(payload);
            true
        }
        Err(e) => {
            warn!(
                "Failed to encode {} message for {}: {}",
                message.kind(),
                channel.id(),
                e
            );
            false
        }
    }
}
