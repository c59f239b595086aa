//! In-process data channel pairs.
//!
//! Used to wire a sender and a receiver inside one process (tests,
//! benchmarks, embedding). Ordering and reliability come from the
//! underlying unbounded queues.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::{ChannelEvent, Connection, DataChannel};

struct MemoryChannel {
    id: String,
    is_open: Arc<AtomicBool>,
    local: mpsc::UnboundedSender<ChannelEvent>,
    remote: mpsc::UnboundedSender<ChannelEvent>,
}

impl DataChannel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    fn send(&self, payload: Vec<u8>) {
        if self.is_open() {
            let _ = self.remote.send(ChannelEvent::Data(payload));
        }
    }

    fn close(&self) {
        if self.is_open.swap(false, Ordering::AcqRel) {
            let _ = self.local.send(ChannelEvent::Close);
            let _ = self.remote.send(ChannelEvent::Close);
        }
    }
}

/// Creates two connected ends. Both observe `Open` immediately; closing
/// either end closes both.
pub fn pair() -> (Connection, Connection) {
    let is_open = Arc::new(AtomicBool::new(true));
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let _ = a_tx.send(ChannelEvent::Open);
    let _ = b_tx.send(ChannelEvent::Open);

    let a = MemoryChannel {
        id: Uuid::new_v4().to_string(),
        is_open: is_open.clone(),
        local: a_tx.clone(),
        remote: b_tx.clone(),
    };
    let b = MemoryChannel {
        id: Uuid::new_v4().to_string(),
        is_open,
        local: b_tx,
        remote: a_tx,
    };
    (
        Connection::new(Arc::new(a), a_rx),
        Connection::new(Arc::new(b), b_rx),
    )
}
