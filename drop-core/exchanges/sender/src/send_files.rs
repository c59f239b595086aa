mod handler;
mod state;

use crate::SenderConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use handler::SendFilesHandler;
use peerdrop_common::{Connection, FileDescriptor, TransferError};
use peerdrop_entities::File;
use std::{collections::HashMap, collections::HashSet, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use handler::{
    SendFilesConnectingEvent, SendFilesSendingEvent, SendFilesStatusEvent,
    SendFilesSubscriber,
};
pub use state::{
    INVALID_PASSWORD_MESSAGE, SenderAction, SenderConnectionState,
    SenderConnectionStatus,
};

pub struct SendFilesRequest {
    pub files: Vec<File>,
    /// Shared secret receivers must present. Empty means no password.
    pub password: String,
    pub config: SenderConfig,
}

/// A published transfer set, ready to serve any number of receivers.
pub struct SendFilesBubble {
    handler: Arc<SendFilesHandler>,
    created_at: DateTime<Utc>,
}
impl SendFilesBubble {
    fn new(handler: Arc<SendFilesHandler>) -> Self {
        Self {
            handler,
            created_at: Utc::now(),
        }
    }

    /// Serves an inbound connection handed over by the transport.
    ///
    /// Each connection runs on its own task, isolated from the others.
    pub fn accept(&self, connection: Connection) -> JoinHandle<()> {
        debug!("Accepting connection {}", connection.id());
        self.handler.accept(connection)
    }

    pub fn files(&self) -> &[FileDescriptor] {
        self.handler.descriptors()
    }

    pub fn config(&self) -> &SenderConfig {
        self.handler.config()
    }

    /// Snapshot of every connection seen so far, keyed by connection id.
    ///
    /// Closed connections stay in the map with their final status.
    pub fn connections(&self) -> HashMap<String, SenderConnectionState> {
        self.handler.connections()
    }

    pub fn connection(&self, id: &str) -> Option<SenderConnectionState> {
        self.handler.connection(id)
    }

    /// Number of connections that have not ended yet.
    pub fn active_connections(&self) -> usize {
        self.handler.active_connections()
    }

    pub fn cancel(&self) {
        info!("Cancelling file transfer");
        self.handler.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handler.is_cancelled()
    }

    pub fn get_created_at(&self) -> String {
        self.created_at.to_rfc3339()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn SendFilesSubscriber>) {
        self.handler.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn SendFilesSubscriber>) {
        self.handler.unsubscribe(subscriber);
    }
}

/// Publishes `request.files` for download.
///
/// Fails if there is nothing to send or two files share a path.
pub fn send_files(request: SendFilesRequest) -> Result<SendFilesBubble> {
    if request.files.is_empty() {
        return Err(TransferError::NoFiles.into());
    }
    let mut seen = HashSet::new();
    for file in &request.files {
        if !seen.insert(file.full_path.as_str()) {
            return Err(TransferError::DuplicatePath(file.full_path.clone()).into());
        }
    }

    info!("Publishing {} files", request.files.len());
    debug!(
        "Sender config: chunk_size={}, buffer_size={}, password={}",
        request.config.chunk_size,
        request.config.buffer_size,
        !request.password.is_empty()
    );

    let handler = Arc::new(SendFilesHandler::new(
        request.files,
        request.password,
        request.config,
    ));
    Ok(SendFilesBubble::new(handler))
}
