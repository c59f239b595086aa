use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result, anyhow};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use peerdrop_sender::{
    Data, File, SendFilesBubble, SendFilesConnectingEvent, SendFilesRequest,
    SendFilesSendingEvent, SendFilesStatusEvent, SendFilesSubscriber,
    SenderConfig, SenderConnectionStatus, send_files,
};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{CliConfig, SendArgs, tcp::Listener};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Positioned reads from a file on disk.
///
/// The handle is opened lazily and shared between connections behind a
/// mutex; every read seeks first, so readers never observe each other's
/// cursor.
pub struct DiskData {
    path: PathBuf,
    size: u64,
    handle: Mutex<Option<fs::File>>,
}

impl DiskData {
    pub fn new(path: PathBuf) -> Result<Self> {
        let metadata = fs::metadata(&path).with_context(|| {
            format!("Failed to get metadata for file: {}", path.display())
        })?;
        Ok(Self {
            path,
            size: metadata.len(),
            handle: Mutex::new(None),
        })
    }
}

impl Data for DiskData {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let end = offset.saturating_add(len).min(self.size);
        if offset >= end {
            return Ok(Vec::new());
        }

        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match handle.as_mut() {
            Some(file) => file,
            None => handle.insert(fs::File::open(&self.path)?),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; (end - offset) as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

/// Expands `paths` into the published file set.
///
/// A file is published as `/<name>`. A directory is walked and each file
/// under it becomes `/<dir>/<relative path>`.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<File>> {
    if paths.is_empty() {
        return Err(anyhow!("Cannot send an empty list of files"));
    }

    let mut files = Vec::new();
    let mut seen = HashSet::new();
    for path in paths {
        if !path.exists() {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
        let base = path.parent().unwrap_or_else(|| Path::new(""));

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.with_context(|| {
                format!("Failed to walk {}", path.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
            let full_path = full_path_of(relative)?;
            if !seen.insert(full_path.clone()) {
                return Err(anyhow!("Two inputs map to {}", full_path));
            }

            let data = DiskData::new(entry.path().to_path_buf())?;
            files.push(File::new(full_path, DEFAULT_MIME_TYPE, Arc::new(data)));
        }
    }

    if files.is_empty() {
        return Err(anyhow!("No regular files found to send"));
    }
    Ok(files)
}

fn full_path_of(relative: &Path) -> Result<String> {
    let mut full_path = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            let part = part.to_str().ok_or_else(|| {
                anyhow!("Invalid file name: {}", relative.display())
            })?;
            full_path.push('/');
            full_path.push_str(part);
        }
    }
    if full_path.is_empty() {
        return Err(anyhow!("Invalid file name: {}", relative.display()));
    }
    Ok(full_path)
}

/// Publishes the files and serves receivers until Ctrl+C.
pub async fn run_send(
    args: SendArgs,
    config: &CliConfig,
    verbose: bool,
) -> Result<()> {
    let files = collect_files(&args.paths)?;
    let mut sender_config = SenderConfig::default();
    if let Some(chunk_size) = args.chunk_size.or(config.chunk_size) {
        sender_config.chunk_size = chunk_size;
    }

    let bind = args.bind.as_deref().unwrap_or(config.bind_addr());
    let listener = Listener::bind(bind)
        .await
        .with_context(|| format!("Failed to listen on {}", bind))?;
    let local_addr = listener.local_addr()?;

    let total: u64 = files.iter().map(File::size).sum();
    let count = files.len();
    let bubble = send_files(SendFilesRequest {
        files,
        password: args.password.unwrap_or_default(),
        config: sender_config,
    })
    .context("Failed to publish files")?;

    let progress = Arc::new(SendProgress::new(verbose));
    bubble.subscribe(progress.clone());

    println!("\n========================================");
    println!("PeerDrop - Sender");
    println!("========================================\n");
    println!("Sharing {} files ({} bytes)", count, total);
    for file in bubble.files() {
        println!("   {} ({} bytes)", file.full_path, file.size);
    }
    println!("\nListening on {}", local_addr);
    println!("Receivers run: peerdrop receive <this-host>:{}", local_addr.port());
    println!("Press Ctrl+C to stop sharing");
    println!("========================================\n");

    serve(&bubble, &listener).await;
    Ok(())
}

async fn serve(bubble: &SendFilesBubble, listener: &Listener) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                bubble.cancel();
                info!("Served {} connections", bubble.connections().len());
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((connection, peer)) => {
                    info!("Receiver connected from {}", peer);
                    bubble.accept(connection);
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }
}

/// One progress bar per receiving connection.
struct SendProgress {
    id: String,
    verbose: bool,
    mp: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl SendProgress {
    fn new(verbose: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            verbose,
            mp: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
    }
}

fn short_id(connection_id: &str) -> &str {
    connection_id.get(..8).unwrap_or(connection_id)
}

impl SendFilesSubscriber for SendProgress {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        if self.verbose {
            let _ = self.mp.println(format!("[DEBUG] {}", message));
        }
    }

    fn notify_connecting(&self, event: SendFilesConnectingEvent) {
        let device = [
            event.metadata.browser_name.as_deref(),
            event.metadata.os_name.as_deref(),
        ]
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(" on ");
        let device = if device.is_empty() {
            String::from("unknown device")
        } else {
            device
        };
        let _ = self.mp.println(format!(
            "Receiver {} connected ({})",
            short_id(&event.connection_id),
            device
        ));
    }

    fn notify_sending(&self, event: SendFilesSendingEvent) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let pb = bars.entry(event.connection_id.clone()).or_insert_with(|| {
            let pb = self.mp.add(ProgressBar::new(0));
            pb.set_style(Self::bar_style());
            pb
        });

        let total = event.sent + event.remaining;
        pb.set_length(total);
        pb.set_position(event.sent);
        pb.set_message(format!(
            "{} {}",
            short_id(&event.connection_id),
            event.full_path
        ));
        if event.remaining == 0 {
            pb.finish_with_message(format!(
                "{} [SENT] {}",
                short_id(&event.connection_id),
                event.full_path
            ));
        }
    }

    fn notify_status(&self, event: SendFilesStatusEvent) {
        match event.status {
            SenderConnectionStatus::Done => {
                let _ = self.mp.println(format!(
                    "Receiver {} finished downloading",
                    short_id(&event.connection_id)
                ));
            }
            SenderConnectionStatus::InvalidPassword => {
                let _ = self.mp.println(format!(
                    "Receiver {} gave a wrong password",
                    short_id(&event.connection_id)
                ));
            }
            SenderConnectionStatus::Closed => {
                let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(pb) = bars.get(&event.connection_id) {
                    if !pb.is_finished() {
                        pb.abandon_with_message(format!(
                            "{} [DISCONNECTED]",
                            short_id(&event.connection_id)
                        ));
                    }
                }
            }
            _ => {}
        }
    }
}
