use peerdrop_common::{
    ChannelEvent, Chunk, DataChannel, FileDescriptor, Message, PeerMetadata,
    RequestInfo, TransferError, TransferResult, clean_error_message,
    send_message,
};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::state::{ChunkOutcome, ReceiverStatus, ReceiverTransferState};
use crate::{
    ReceiverConfig,
    stream::{FileWriter, IncomingFile, file_channel},
};

/// Observer interface for receiver-side activity.
pub trait ReceiveFilesSubscriber: Send + Sync {
    fn get_id(&self) -> String;
    fn log(&self, message: String);
    fn notify_listing(&self, event: ReceiveFilesListingEvent);
    fn notify_receiving(&self, event: ReceiveFilesReceivingEvent);
    fn notify_finished(&self, event: ReceiveFilesFinishedEvent);
}

pub struct ReceiveFilesListingEvent {
    pub files: Vec<FileDescriptor>,
}

pub struct ReceiveFilesReceivingEvent {
    pub full_path: String,
    /// Offset within the file reached so far.
    pub received: u64,
    pub size: u64,
    pub bytes_received_total: u64,
}

pub struct ReceiveFilesFinishedEvent {
    pub status: ReceiverStatus,
    pub error: Option<String>,
}

pub(crate) type Subscribers =
    RwLock<HashMap<String, Arc<dyn ReceiveFilesSubscriber>>>;

pub(crate) enum Command {
    Start {
        offsets: HashMap<String, u64>,
        reply: oneshot::Sender<TransferResult<Vec<IncomingFile>>>,
    },
    Pause,
    Resume,
}

/// Drives one receiving session from the first `Open` to the close.
pub(crate) struct Carrier {
    pub(crate) channel: Arc<dyn DataChannel>,
    pub(crate) password: String,
    pub(crate) metadata: PeerMetadata,
    pub(crate) config: ReceiverConfig,
    pub(crate) state: ReceiverTransferState,
    pub(crate) state_tx: watch::Sender<ReceiverTransferState>,
    pub(crate) subscribers: Arc<Subscribers>,
    pub(crate) writers: Vec<Option<FileWriter>>,
}

impl Carrier {
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        info!("Receiving session on {} started", self.channel.id());
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::Close) | None => break,
                    Some(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                },
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }
        self.finish();
    }

    /// Returns `false` once the session is over.
    async fn handle_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Open => {
                debug!("Channel {} is open, requesting listing", self.channel.id());
                self.send(&Message::RequestInfo(RequestInfo {
                    metadata: self.metadata.clone(),
                    password: self.password.clone(),
                }));
            }
            ChannelEvent::Data(payload) => match Message::decode(&payload) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => warn!("Dropping malformed message: {}", e),
            },
            ChannelEvent::Error(message) => {
                let message = clean_error_message(&message);
                error!("Channel failed: {}", message);
                self.fail(message);
                self.channel.close();
            }
            ChannelEvent::PeerError(message) => {
                error!("Peer failed: {}", message);
                self.fail(message);
                if !self.channel.is_open() {
                    return false;
                }
                self.channel.close();
            }
            ChannelEvent::Close => return false,
        }
        true
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Info(info) => {
                let files = info.files;
                if !self.state.on_info(files.clone()) {
                    debug!("Ignoring repeated Info");
                    return;
                }
                info!("Sender offers {} files", files.len());
                self.publish();
                self.notify(|s| {
                    s.notify_listing(ReceiveFilesListingEvent {
                        files: files.clone(),
                    })
                });
            }
            Message::Chunk(chunk) => self.handle_chunk(chunk).await,
            Message::Error(remote) => {
                error!("Sender reported: {}", remote.error);
                self.fail(remote.error);
                self.channel.close();
            }
            other => {
                debug!("Ignoring unexpected {} message", other.kind());
            }
        }
    }

    async fn handle_chunk(&mut self, chunk: Chunk) {
        match self.state.on_chunk(&chunk) {
            ChunkOutcome::Ignored => {
                debug!("Ignoring chunk for {} while {}", chunk.full_path, self.state.status);
            }
            ChunkOutcome::Duplicate => {
                debug!("Dropping duplicate chunk {}@{}", chunk.full_path, chunk.offset);
            }
            ChunkOutcome::Unexpected => {
                warn!(
                    "Dropping unexpected chunk {}@{} (expecting {:?}@{})",
                    chunk.full_path,
                    chunk.offset,
                    self.state.current_file().map(|f| f.full_path.as_str()),
                    self.state.current_offset
                );
            }
            ChunkOutcome::SizeMismatch {
                full_path,
                received,
                expected,
            } => {
                let e = TransferError::SizeMismatch {
                    full_path,
                    received,
                    expected,
                };
                error!("Protocol violation: {}", e);
                self.fail(e.to_string());
                self.channel.close();
            }
            ChunkOutcome::Progress { index } => {
                self.append(index, chunk).await;
            }
            ChunkOutcome::FileComplete {
                index,
                next,
                cancel_resend,
            } => {
                self.append(index, chunk).await;
                self.complete(index).await;
                if cancel_resend {
                    self.cancel_resend();
                }
                if let Some(next) = next {
                    info!("Requesting {}", next.full_path);
                    self.send(&Message::Start(next));
                }
            }
            ChunkOutcome::AllComplete {
                index,
                cancel_resend,
            } => {
                self.append(index, chunk).await;
                self.complete(index).await;
                if cancel_resend {
                    self.cancel_resend();
                }
                info!("All files received, {} bytes", self.state.bytes_received_total);
                self.send(&Message::Done);
                self.publish();
                self.notify_finished();
            }
        }
    }

    /// The sender may still be answering the last resume request with a
    /// re-upload of the file that just completed. It only takes a new
    /// `Start` or `Done` once paused.
    fn cancel_resend(&self) {
        debug!("Stopping re-upload requested by resume");
        self.send(&Message::Pause);
    }

    async fn append(&mut self, index: usize, chunk: Chunk) {
        let received = chunk.end();
        let full_path = chunk.full_path;
        let size = self
            .state
            .files()
            .get(index)
            .map(|f| f.size)
            .unwrap_or_default();
        if let Some(writer) = self.writers.get(index).and_then(Option::as_ref) {
            if !writer.write(chunk.bytes).await {
                debug!("Output for {} was dropped, discarding bytes", full_path);
            }
        }
        self.publish();

        let bytes_received_total = self.state.bytes_received_total;
        self.notify(|s| {
            s.notify_receiving(ReceiveFilesReceivingEvent {
                full_path: full_path.clone(),
                received,
                size,
                bytes_received_total,
            })
        });
    }

    async fn complete(&mut self, index: usize) {
        if let Some(writer) = self.writers.get_mut(index).and_then(Option::take) {
            writer.finish().await;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { offsets, reply } => {
                let result = self.begin(&offsets);
                if reply.send(result).is_err() {
                    debug!("Start requester went away");
                }
            }
            Command::Pause => {
                if self.state.on_pause() {
                    info!("Pausing download");
                    self.send(&Message::Pause);
                    self.publish();
                }
            }
            Command::Resume => {
                if let Some(start) = self.state.resume_request() {
                    info!("Resuming {} at {}", start.full_path, start.offset);
                    self.send(&Message::Start(start));
                    self.publish();
                }
            }
        }
    }

    fn begin(
        &mut self,
        offsets: &HashMap<String, u64>,
    ) -> TransferResult<Vec<IncomingFile>> {
        let first = self.state.begin(offsets)?;

        let capacity = self.config.stream_buffer;
        let (writers, streams): (Vec<_>, Vec<_>) = self
            .state
            .files()
            .iter()
            .zip(&self.state.start_offsets)
            .map(|(file, offset)| {
                let (writer, stream) = file_channel(file.clone(), *offset, capacity);
                (Some(writer), stream)
            })
            .unzip();
        self.writers = writers;

        info!("Requesting {} at {}", first.full_path, first.offset);
        self.send(&Message::Start(first));
        self.publish();
        Ok(streams)
    }

    fn send(&self, message: &Message) {
        if !send_message(self.channel.as_ref(), message) {
            debug!("Channel closed, {} not sent", message.kind());
        }
    }

    fn fail(&mut self, error: String) {
        self.notify(|s| s.log(error.clone()));
        self.state.fail(error);
        // Unfinished outputs end as interrupted.
        self.writers.clear();
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn ReceiveFilesSubscriber),
    {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .for_each(|s| f(s.as_ref()));
    }

    fn notify_finished(&self) {
        let status = self.state.status;
        let error = self.state.error.clone();
        self.notify(|s| {
            s.notify_finished(ReceiveFilesFinishedEvent {
                status,
                error: error.clone(),
            })
        });
    }

    fn finish(mut self) {
        self.state.on_close();
        self.writers.clear();
        self.publish();
        // Completion was already announced when the last file arrived.
        if self.state.status != ReceiverStatus::Done {
            self.notify_finished();
        }
        info!(
            "Receiving session on {} ended with status {}",
            self.channel.id(),
            self.state.status
        );
    }
}
