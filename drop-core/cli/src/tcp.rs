//! Data channels over plain TCP.
//!
//! Each payload travels as one frame: a 4-byte big-endian length followed by
//! the payload bytes. A reader task turns inbound frames into
//! [`ChannelEvent`]s and a writer task drains the outbound queue, so `send`
//! never blocks the caller.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use peerdrop_common::{ChannelEvent, Connection, DataChannel, TransferError};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpListener, TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest payload accepted in one frame (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const FRAME_HEADER_LEN: u64 = 4;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

pub struct TcpChannel {
    id: String,
    is_open: AtomicBool,
    buffered: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl TcpChannel {
    /// Marks the channel closed, stops the writer and emits `Close` once.
    fn shut(&self) {
        if self.is_open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
            let _ = self.events.send(ChannelEvent::Close);
        }
    }

    fn report(&self, error: &io::Error) {
        if self.is_open() {
            warn!("Channel {} failed: {}", self.id, error);
            let _ = self.events.send(ChannelEvent::Error(error.to_string()));
        }
    }
}

impl DataChannel for TcpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    fn send(&self, payload: Vec<u8>) {
        if !self.is_open() {
            return;
        }
        let len = payload.len() as u64 + FRAME_HEADER_LEN;
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.outbound.send(Outbound::Frame(payload)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
        }
    }

    fn close(&self) {
        debug!("Closing channel {}", self.id);
        self.shut();
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }
}

/// Wraps an established stream. The returned connection observes `Open`
/// first.
pub fn from_stream(stream: TcpStream) -> Connection {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (reader, writer) = stream.into_split();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let _ = events_tx.send(ChannelEvent::Open);

    let channel = Arc::new(TcpChannel {
        id: Uuid::new_v4().to_string(),
        is_open: AtomicBool::new(true),
        buffered: AtomicU64::new(0),
        outbound: outbound_tx,
        events: events_tx,
    });
    tokio::spawn(read_frames(channel.clone(), reader));
    tokio::spawn(write_frames(channel.clone(), writer, outbound));

    Connection::new(channel, events)
}

/// Dials a sender.
pub async fn connect(addr: &str) -> Result<Connection, TransferError> {
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        TransferError::Transport(format!(
            "Could not connect to peer {}: {}",
            addr, e
        ))
    })?;
    info!("Connected to {}", addr);
    Ok(from_stream(stream))
}

/// Accepts inbound connections for a sender.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(Connection, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        debug!("Accepted TCP connection from {}", peer);
        Ok((from_stream(stream), peer))
    }
}

async fn read_frames(channel: Arc<TcpChannel>, mut reader: OwnedReadHalf) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                if !channel.is_open() {
                    break;
                }
                let _ = channel.events.send(ChannelEvent::Data(payload));
            }
            Ok(None) => {
                debug!("Peer closed channel {}", channel.id);
                break;
            }
            Err(e) => {
                channel.report(&e);
                break;
            }
        }
    }
    channel.shut();
}

async fn write_frames(
    channel: Arc<TcpChannel>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        let payload = match item {
            Outbound::Frame(payload) => payload,
            Outbound::Close => break,
        };
        let result = write_frame(&mut writer, &payload).await;
        channel
            .buffered
            .fetch_sub(payload.len() as u64 + FRAME_HEADER_LEN, Ordering::AcqRel);
        if let Err(e) = result {
            channel.report(&e);
            channel.shut();
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down channel {}: {}", channel.id, e);
    }
}

/// Reads one frame. Returns `Ok(None)` when the stream ends between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_SIZE
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_SIZE
            ),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await
}
