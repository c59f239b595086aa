//! Turns the per-file streams of a download into a single output.
//!
//! One file is handed through untouched. Several files become a tar archive
//! built on a blocking thread: the builder pulls each file's bytes as they
//! arrive and pushes archive blocks through a bounded queue, so neither the
//! files nor the archive are ever held in memory as a whole.

use crate::stream::IncomingFile;
use peerdrop_common::{TransferError, TransferResult};
use std::io::{self, BufWriter, Write};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, error, info};

const ARCHIVE_QUEUE_DEPTH: usize = 16;
const ARCHIVE_BLOCK_SIZE: usize = 64 * 1024;

pub enum DownloadOutput {
    Single(IncomingFile),
    Archive(ArchiveStream),
}

impl DownloadOutput {
    /// Suggested file name for the output.
    pub fn name(&self) -> String {
        match self {
            DownloadOutput::Single(file) => entry_path(file.full_path()),
            DownloadOutput::Archive(archive) => archive.name().to_string(),
        }
    }

    /// Copies the whole output into `sink`. Returns the number of bytes
    /// written.
    pub async fn write_to<W>(self, sink: &mut W) -> TransferResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            DownloadOutput::Single(file) => file.write_to(sink).await,
            DownloadOutput::Archive(archive) => archive.write_to(sink).await,
        }
    }
}

/// Packages `files` for saving. See the module docs.
pub fn package(files: Vec<IncomingFile>) -> TransferResult<DownloadOutput> {
    match files.len() {
        0 => Err(TransferError::NoFiles),
        1 => {
            let mut files = files;
            match files.pop() {
                Some(file) => Ok(DownloadOutput::Single(file)),
                None => Err(TransferError::NoFiles),
            }
        }
        _ => Ok(DownloadOutput::Archive(ArchiveStream::spawn(files))),
    }
}

/// Path of a file inside the output: its full path without the leading `/`.
fn entry_path(full_path: &str) -> String {
    let relative = full_path.trim_start_matches('/');
    if relative.is_empty() {
        String::from("download")
    } else {
        relative.to_string()
    }
}

fn archive_name() -> String {
    format!(
        "peerdrop-download-{}.tar",
        chrono::Utc::now().timestamp_millis()
    )
}

enum Block {
    Bytes(Vec<u8>),
    End,
    Failed(io::Error),
}

/// Forwards everything written to it as blocks on a channel.
struct ChannelWriter {
    tx: mpsc::Sender<Block>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Block::Bytes(buf.to_vec()))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A tar archive of several incoming files, produced on demand.
pub struct ArchiveStream {
    name: String,
    rx: mpsc::Receiver<Block>,
    is_finished: bool,
}

impl ArchiveStream {
    fn spawn(files: Vec<IncomingFile>) -> Self {
        let (tx, rx) = mpsc::channel(ARCHIVE_QUEUE_DEPTH);
        let name = archive_name();
        info!("Packaging {} files into {}", files.len(), name);

        tokio::task::spawn_blocking(move || {
            let status = tx.clone();
            match build_archive(files, ChannelWriter { tx }) {
                Ok(()) => {
                    let _ = status.blocking_send(Block::End);
                }
                Err(e) => {
                    error!("Failed to build archive: {}", e);
                    let _ = status.blocking_send(Block::Failed(e));
                }
            }
        });

        Self {
            name,
            rx,
            is_finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next run of archive bytes, or `Ok(None)` once the archive is
    /// complete.
    pub async fn next_chunk(&mut self) -> TransferResult<Option<Vec<u8>>> {
        if self.is_finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Block::Bytes(bytes)) => Ok(Some(bytes)),
            Some(Block::End) => {
                self.is_finished = true;
                Ok(None)
            }
            Some(Block::Failed(e)) => Err(TransferError::Io(e)),
            None => Err(TransferError::Interrupted(self.name.clone())),
        }
    }

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
}

fn build_archive(files: Vec<IncomingFile>, writer: ChannelWriter) -> io::Result<()> {
    let mut builder =
        tar::Builder::new(BufWriter::with_capacity(ARCHIVE_BLOCK_SIZE, writer));
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;

    for file in files {
        let path = entry_path(file.full_path());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(file.expected_len());
        header.set_mode(0o644);
        header.set_mtime(mtime);
        debug!("Adding {} ({} bytes) to archive", path, file.expected_len());
        builder.append_data(&mut header, &path, file.into_reader())?;
    }

    builder.into_inner()?.flush()
}
