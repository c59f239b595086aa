use peerdrop_common::{
    ChannelEvent, Chunk, ChunkRange, Connection, DataChannel, FileDescriptor,
    Message, PeerMetadata, clean_error_message, next_chunk, send_message,
};
use peerdrop_entities::File;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::state::{
    SenderAction, SenderConnectionState, SenderConnectionStatus,
};
use crate::SenderConfig;

const CONGESTION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Observer interface for sender-side activity.
///
/// Implementors must be thread-safe (`Send + Sync`); notifications are
/// dispatched from the per-connection tasks.
pub trait SendFilesSubscriber: Send + Sync {
    /// A stable unique identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;
    fn log(&self, message: String);
    /// A receiver passed the password gate.
    fn notify_connecting(&self, event: SendFilesConnectingEvent);
    /// A chunk was handed to a receiver's channel.
    fn notify_sending(&self, event: SendFilesSendingEvent);
    fn notify_status(&self, event: SendFilesStatusEvent);
}

pub struct SendFilesConnectingEvent {
    pub connection_id: String,
    pub metadata: PeerMetadata,
}

pub struct SendFilesSendingEvent {
    pub connection_id: String,
    pub full_path: String,
    pub sent: u64,
    pub remaining: u64,
}

pub struct SendFilesStatusEvent {
    pub connection_id: String,
    pub status: SenderConnectionStatus,
}

type Subscribers = RwLock<HashMap<String, Arc<dyn SendFilesSubscriber>>>;

/// State shared by every connection of one sending session.
///
/// Files, descriptors and the password are immutable. The registry holds a
/// snapshot of each connection's state; only that connection's task writes
/// its entry.
pub struct SendFilesHandler {
    files: Vec<File>,
    descriptors: Vec<FileDescriptor>,
    password: String,
    config: SenderConfig,
    is_cancelled: AtomicBool,
    connections: RwLock<HashMap<String, SenderConnectionState>>,
    channels: RwLock<HashMap<String, Arc<dyn DataChannel>>>,
    subscribers: Subscribers,
}
impl Debug for SendFilesHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendFilesHandler")
            .field("files", &self.files)
            .field("config", &self.config)
            .field("is_cancelled", &self.is_cancelled)
            .finish()
    }
}
impl SendFilesHandler {
    pub fn new(files: Vec<File>, password: String, config: SenderConfig) -> Self {
        let descriptors = files.iter().map(FileDescriptor::from).collect();
        Self {
            files,
            descriptors,
            password,
            config,
            is_cancelled: AtomicBool::new(false),
            connections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn descriptors(&self) -> &[FileDescriptor] {
        &self.descriptors
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> HashMap<String, SenderConnectionState> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection(&self, id: &str) -> Option<SenderConnectionState> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn active_connections(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn SendFilesSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber.get_id(), subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn SendFilesSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscriber.get_id());
    }

    /// Closes every live connection and refuses new ones.
    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Release);
        let channels: Vec<_> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for channel in channels {
            channel.close();
        }
    }

    /// Starts serving one inbound connection on its own task.
    pub fn accept(self: &Arc<Self>, connection: Connection) -> JoinHandle<()> {
        let Connection { channel, events } = connection;
        let id = channel.id().to_string();

        if self.is_cancelled() {
            debug!("Refusing connection {} on a cancelled session", id);
            channel.close();
        }

        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), channel.clone());

        let mut carrier = Carrier {
            id,
            channel,
            handler: self.clone(),
            state: SenderConnectionState::new(),
            published_status: None,
        };
        carrier.publish();

        tokio::spawn(carrier.run(events))
    }

    fn file(&self, full_path: &str) -> Option<&File> {
        self.files
            .iter()
            .find(|f| f.full_path == full_path)
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn SendFilesSubscriber),
    {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .for_each(|s| f(s.as_ref()));
    }

    fn log(&self, message: String) {
        self.notify(|s| s.log(message.clone()));
    }
}

/// Drives one connection: decodes inbound messages, applies them to the
/// connection state and produces chunks while uploading.
struct Carrier {
    id: String,
    channel: Arc<dyn DataChannel>,
    handler: Arc<SendFilesHandler>,
    state: SenderConnectionState,
    published_status: Option<SenderConnectionStatus>,
}
impl Carrier {
    async fn run(mut self, mut events: UnboundedReceiver<ChannelEvent>) {
        info!("Serving connection {}", self.id);
        loop {
            let event = if self.state.upload_position().is_some() {
                // Chunks are produced one per turn. Anything that arrived in
                // the meantime (Pause, close) is handled first.
                tokio::task::yield_now().await;
                match events.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) if self.is_congested() => {
                        tokio::select! {
                            event = events.recv() => event,
                            _ = tokio::time::sleep(CONGESTION_POLL_INTERVAL) => continue,
                        }
                    }
                    Err(TryRecvError::Empty) => {
                        self.send_next_chunk().await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => None,
                }
            } else {
                events.recv().await
            };

            match event {
                Some(ChannelEvent::Close) | None => break,
                Some(event) => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
            }
        }
        self.finish();
    }

    fn is_congested(&self) -> bool {
        self.channel.buffered_amount() > self.handler.config.buffer_size
    }

    /// Returns `false` once the connection is gone.
    fn handle_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Open => {
                debug!("Connection {} is open", self.id);
            }
            ChannelEvent::Data(payload) => match Message::decode(&payload) {
                Ok(message) => self.handle_message(message),
                Err(e) => {
                    warn!("Dropping malformed message from {}: {}", self.id, e);
                }
            },
            ChannelEvent::Error(message) => {
                let message = clean_error_message(&message);
                error!("Connection {} failed: {}", self.id, message);
                self.handler
                    .log(format!("Connection {} failed: {}", self.id, message));
                self.channel.close();
            }
            ChannelEvent::PeerError(message) => {
                error!("Peer failure on {}: {}", self.id, message);
                if !self.channel.is_open() {
                    return false;
                }
                self.channel.close();
            }
            ChannelEvent::Close => return false,
        }
        true
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::RequestInfo(request) => {
                let metadata = request.metadata.clone();
                let actions = self.state.on_request_info(
                    request,
                    &self.handler.password,
                    &self.handler.descriptors,
                );
                if actions.is_empty() {
                    debug!("Ignoring repeated RequestInfo from {}", self.id);
                    return;
                }
                match self.state.status {
                    SenderConnectionStatus::Paused => {
                        info!("Receiver {} unlocked the file list", self.id);
                        self.handler.notify(|s| {
                            s.notify_connecting(SendFilesConnectingEvent {
                                connection_id: self.id.clone(),
                                metadata: metadata.clone(),
                            })
                        });
                    }
                    _ => {
                        warn!("Receiver {} sent an invalid password", self.id);
                    }
                }
                self.publish();
                self.perform(actions);
            }
            Message::Start(start) => {
                let requested = format!("{}@{}", start.full_path, start.offset);
                match self.state.on_start(start, &self.handler.descriptors) {
                    Ok(true) => {
                        info!("Uploading {} to {}", requested, self.id);
                        self.publish();
                    }
                    Ok(false) => {
                        debug!(
                            "Ignoring Start {} from {} while {}",
                            requested, self.id, self.state.status
                        );
                    }
                    Err(e) => {
                        warn!("Rejecting Start from {}: {}", self.id, e);
                    }
                }
            }
            Message::Pause => {
                if self.state.on_pause() {
                    info!("Receiver {} paused the upload", self.id);
                    self.publish();
                }
            }
            Message::Done => {
                let actions = self.state.on_done();
                if !actions.is_empty() {
                    info!("Receiver {} finished downloading", self.id);
                    self.publish();
                    self.perform(actions);
                }
            }
            other => {
                debug!(
                    "Ignoring unexpected {} message from {}",
                    other.kind(),
                    self.id
                );
            }
        }
    }

    fn perform(&self, actions: Vec<SenderAction>) {
        for action in actions {
            match action {
                SenderAction::Send(message) => {
                    send_message(self.channel.as_ref(), &message);
                }
                SenderAction::Close => self.channel.close(),
            }
        }
    }

    async fn send_next_chunk(&mut self) {
        let Some((full_path, offset)) = self
            .state
            .upload_position()
            .map(|(path, offset)| (path.to_string(), offset))
        else {
            return;
        };
        let handler = self.handler.clone();
        let Some(file) = handler.file(&full_path) else {
            self.abort_upload(format!("{} is no longer available", full_path));
            return;
        };

        let chunk_size = handler.config.effective_chunk_size();
        let range = match next_chunk(file.size(), offset, chunk_size) {
            Ok(range) => range,
            Err(e) => {
                self.abort_upload(format!("{}: {}", full_path, e));
                return;
            }
        };

        let bytes = match Self::read_range(file, range).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abort_upload(format!("Failed to read {}: {}", full_path, e));
                return;
            }
        };

        if !self.channel.is_open() {
            debug!("Connection {} closed before chunk at {}", self.id, offset);
            self.state.on_close();
            self.publish();
            return;
        }

        send_message(
            self.channel.as_ref(),
            &Message::Chunk(Chunk {
                full_path: full_path.clone(),
                offset: range.start,
                bytes,
                is_final: range.is_final,
            }),
        );
        self.state.on_chunk_sent(range);
        self.publish();

        let total = file.size();
        self.handler.notify(|s| {
            s.notify_sending(SendFilesSendingEvent {
                connection_id: self.id.clone(),
                full_path: full_path.clone(),
                sent: range.end,
                remaining: total - range.end,
            })
        });
        if range.is_final {
            info!("Sent {} to {}", full_path, self.id);
        }
    }

    async fn read_range(
        file: &File,
        range: ChunkRange,
    ) -> std::io::Result<Vec<u8>> {
        let data = file.data.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            data.read_at(range.start, range.len())
        })
        .await
        .map_err(std::io::Error::other)??;
        if bytes.len() as u64 != range.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, read {}", range.len(), bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Reports a sender-side failure to the receiver and drops the connection.
    fn abort_upload(&mut self, reason: String) {
        error!("Upload to {} failed: {}", self.id, reason);
        self.handler.log(reason.clone());
        send_message(self.channel.as_ref(), &Message::error(reason));
        self.state.on_pause();
        self.publish();
        self.channel.close();
    }

    fn publish(&mut self) {
        self.handler
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.id.clone(), self.state.clone());

        let status = self.state.status;
        if self.published_status != Some(status) {
            self.published_status = Some(status);
            self.handler.notify(|s| {
                s.notify_status(SendFilesStatusEvent {
                    connection_id: self.id.clone(),
                    status,
                })
            });
        }
    }

    fn finish(mut self) {
        self.state.on_close();
        self.publish();
        self.handler
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        info!(
            "Connection {} ended with status {}",
            self.id, self.state.status
        );
    }
}
