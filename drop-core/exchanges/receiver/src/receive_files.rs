mod handler;
mod state;

use crate::{ReceiverConfig, stream::IncomingFile};
use anyhow::Result;
use chrono::{DateTime, Utc};
use handler::{Carrier, Command, Subscribers};
use peerdrop_common::{
    Connection, DataChannel, FileDescriptor, PeerMetadata, TransferError,
};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

pub use handler::{
    ReceiveFilesFinishedEvent, ReceiveFilesListingEvent,
    ReceiveFilesReceivingEvent, ReceiveFilesSubscriber,
};
pub use state::{ChunkOutcome, ReceiverStatus, ReceiverTransferState};

pub struct ReceiveFilesRequest {
    /// A connection to the sender, typically not yet open.
    pub connection: Connection,
    pub password: String,
    pub metadata: PeerMetadata,
    pub config: ReceiverConfig,
}

/// Handle on one download session.
///
/// The session requests the listing as soon as the channel opens. Nothing
/// is downloaded until `start` or `start_from` authorizes it.
pub struct ReceiveFilesBubble {
    channel: Arc<dyn DataChannel>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ReceiverTransferState>,
    subscribers: Arc<Subscribers>,
    created_at: DateTime<Utc>,
}
impl ReceiveFilesBubble {
    /// Snapshot of the transfer state.
    pub fn state(&self) -> ReceiverTransferState {
        self.state.borrow().clone()
    }

    pub fn files(&self) -> Option<Vec<FileDescriptor>> {
        self.state.borrow().files_info.clone()
    }

    /// Waits until the sender's listing arrives.
    ///
    /// Fails with the recorded error if the session ends first.
    pub async fn wait_for_listing(&self) -> Result<Vec<FileDescriptor>> {
        let state = self
            .wait_for(|s| s.files_info.is_some() || s.status.is_finished())
            .await;
        match state.files_info {
            Some(files) => Ok(files),
            None => Err(session_error(&state).into()),
        }
    }

    /// Waits until the session has ended and returns its final state.
    pub async fn wait_until_finished(&self) -> ReceiverTransferState {
        self.wait_for(|s| s.status.is_finished()).await
    }

    async fn wait_for<F>(&self, condition: F) -> ReceiverTransferState
    where
        F: FnMut(&ReceiverTransferState) -> bool,
    {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(condition).await {
            return state.clone();
        }
        // The session task is gone; its last snapshot is final.
        let state = rx.borrow().clone();
        state
    }

    /// Downloads every listed file from the beginning.
    ///
    /// Returns one stream per file in listing order.
    pub async fn start(&self) -> Result<Vec<IncomingFile>> {
        self.start_from(HashMap::new()).await
    }

    /// Downloads every listed file, resuming the ones named in `offsets`
    /// from the given byte offset.
    pub async fn start_from(
        &self,
        offsets: HashMap<String, u64>,
    ) -> Result<Vec<IncomingFile>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start { offsets, reply })
            .map_err(|_| ended())?;
        let files = response.await.map_err(|_| ended())??;
        info!("Downloading {} files", files.len());
        Ok(files)
    }

    /// Asks the sender to stop after the chunk in flight.
    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    /// Continues a paused download where it stopped.
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Closes the connection. Unfinished streams end as interrupted.
    pub fn cancel(&self) {
        info!("Cancelling file reception");
        self.channel.close();
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().status.is_finished()
    }

    pub fn get_created_at(&self) -> String {
        self.created_at.to_rfc3339()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ReceiveFilesSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber.get_id(), subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn ReceiveFilesSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscriber.get_id());
    }
}

fn ended() -> TransferError {
    TransferError::InvalidState(String::from("the session has ended"))
}

fn session_error(state: &ReceiverTransferState) -> TransferError {
    match &state.error {
        Some(error) => TransferError::Remote(error.clone()),
        None => TransferError::Interrupted(String::from("file listing")),
    }
}

/// Starts a download session over `request.connection`.
///
/// Must be called within a Tokio runtime.
pub fn receive_files(request: ReceiveFilesRequest) -> ReceiveFilesBubble {
    let Connection { channel, events } = request.connection;
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(ReceiverTransferState::new());
    let subscribers: Arc<Subscribers> = Arc::new(RwLock::new(HashMap::new()));

    let carrier = Carrier {
        channel: channel.clone(),
        password: request.password,
        metadata: request.metadata,
        config: request.config,
        state: ReceiverTransferState::new(),
        state_tx,
        subscribers: subscribers.clone(),
        writers: Vec::new(),
    };
    tokio::spawn(carrier.run(events, command_rx));

    ReceiveFilesBubble {
        channel,
        commands,
        state,
        subscribers,
        created_at: Utc::now(),
    }
}
