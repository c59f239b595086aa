//! Per-file output streams.
//!
//! The orchestrator owns a [`FileWriter`] for every requested file and hands
//! the matching [`IncomingFile`] to the caller. Bytes flow through a bounded
//! queue, so a slow consumer holds back reassembly instead of growing memory.
//! A stream only ends cleanly after its final chunk; if the writer goes away
//! first (connection closed, remote error) the consumer sees
//! [`TransferError::Interrupted`].

use peerdrop_common::{FileDescriptor, TransferError, TransferResult};
use std::io::{self, Read};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::debug;

enum Piece {
    Bytes(Vec<u8>),
    End,
}

/// Creates a connected writer/stream pair for `descriptor`, starting at
/// `offset` bytes into the file.
pub(crate) fn file_channel(
    descriptor: FileDescriptor,
    offset: u64,
    capacity: usize,
) -> (FileWriter, IncomingFile) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = FileWriter {
        full_path: descriptor.full_path.clone(),
        tx,
    };
    let stream = IncomingFile {
        descriptor,
        offset,
        rx,
        is_finished: false,
    };
    (writer, stream)
}

pub(crate) struct FileWriter {
    full_path: String,
    tx: mpsc::Sender<Piece>,
}

impl FileWriter {
    /// Appends bytes. Returns `false` once the consumer dropped its stream.
    pub(crate) async fn write(&self, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(Piece::Bytes(bytes)).await.is_ok()
    }

    /// Marks the stream complete.
    pub(crate) async fn finish(self) {
        if self.tx.send(Piece::End).await.is_err() {
            debug!("Stream for {} was dropped before completion", self.full_path);
        }
    }
}

/// The bytes of one downloaded file, in order, as they arrive.
///
/// Streams of one session are filled in listing order; consume them in that
/// order too, otherwise the bounded buffer of an earlier file stalls the
/// download.
pub struct IncomingFile {
    descriptor: FileDescriptor,
    offset: u64,
    rx: mpsc::Receiver<Piece>,
    is_finished: bool,
}

impl std::fmt::Debug for IncomingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingFile")
            .field("full_path", &self.descriptor.full_path)
            .field("offset", &self.offset)
            .field("size", &self.descriptor.size)
            .field("is_finished", &self.is_finished)
            .finish()
    }
}

impl IncomingFile {
    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn full_path(&self) -> &str {
        &self.descriptor.full_path
    }

    /// Offset in the file of the first byte this stream yields.
    pub fn start_offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes this stream yields when it completes.
    pub fn expected_len(&self) -> u64 {
        self.descriptor.size.saturating_sub(self.offset)
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    /// Next run of bytes, or `Ok(None)` once the file is complete.
    pub async fn next_chunk(&mut self) -> TransferResult<Option<Vec<u8>>> {
        if self.is_finished {
            return Ok(None);
        }
        let piece = self.rx.recv().await;
        self.accept(piece)
    }

    /// Blocking variant of [`Self::next_chunk`] for use off the runtime,
    /// e.g. inside `spawn_blocking`.
    pub fn blocking_next_chunk(&mut self) -> TransferResult<Option<Vec<u8>>> {
        if self.is_finished {
            return Ok(None);
        }
        let piece = self.rx.blocking_recv();
        self.accept(piece)
    }

    fn accept(&mut self, piece: Option<Piece>) -> TransferResult<Option<Vec<u8>>> {
        match piece {
            Some(Piece::Bytes(bytes)) => Ok(Some(bytes)),
            Some(Piece::End) => {
                self.is_finished = true;
                Ok(None)
            }
            None => Err(TransferError::Interrupted(
                self.descriptor.full_path.clone(),
            )),
        }
    }

    /// Copies the whole stream into `sink`. Returns the number of bytes
    /// written.
    pub async fn write_to<W>(mut self, sink: &mut W) -> TransferResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while let Some(bytes) = self.next_chunk().await? {
            sink.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    /// Adapts the stream to `std::io::Read`. Reads block, so only use the
    /// reader outside of async contexts.
    pub fn into_reader(self) -> IncomingFileReader {
        IncomingFileReader {
            file: self,
            buffer: Vec::new(),
            position: 0,
        }
    }
}

pub struct IncomingFileReader {
    file: IncomingFile,
    buffer: Vec<u8>,
    position: usize,
}

impl Read for IncomingFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position == self.buffer.len() {
            match self.file.blocking_next_chunk() {
                Ok(Some(bytes)) => {
                    self.buffer = bytes;
                    self.position = 0;
                }
                Ok(None) => return Ok(0),
                Err(TransferError::Io(e)) => return Err(e),
                Err(e) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, e));
                }
            }
        }
        let available = &self.buffer[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}
