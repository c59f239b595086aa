use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result, anyhow};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use peerdrop_common::{FileDescriptor, PeerMetadata, clean_error_message};
use peerdrop_receiver::{
    ReceiveFilesBubble, ReceiveFilesFinishedEvent, ReceiveFilesListingEvent,
    ReceiveFilesReceivingEvent, ReceiveFilesRequest, ReceiveFilesSubscriber,
    ReceiverConfig, ReceiverStatus, package, receive_files,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{CliConfig, ReceiveArgs, tcp};

/// Device details announced to the sender.
pub fn cli_metadata() -> PeerMetadata {
    PeerMetadata {
        browser_name: Some(String::from("peerdrop-cli")),
        browser_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        os_name: Some(std::env::consts::OS.to_string()),
        ..PeerMetadata::default()
    }
}

/// Downloads everything `args.addr` offers into the output directory.
pub async fn run_receive(
    args: ReceiveArgs,
    config: &mut CliConfig,
    verbose: bool,
) -> Result<PathBuf> {
    let output_dir = match &args.output {
        Some(dir) => dir.clone(),
        None => config.receive_dir(),
    };
    if args.save_dir {
        config.default_receive_dir = Some(output_dir.to_string_lossy().into_owned());
        config.save()?;
        println!("Saved {} as the default receive directory", output_dir.display());
    }

    let connection = tcp::connect(&args.addr)
        .await
        .map_err(|e| anyhow!(clean_error_message(&e.to_string())))?;
    let bubble = receive_files(ReceiveFilesRequest {
        connection,
        password: args.password.unwrap_or_default(),
        metadata: cli_metadata(),
        config: ReceiverConfig::default(),
    });
    let progress = Arc::new(ReceiveProgress::new(verbose));
    bubble.subscribe(progress.clone());

    let files = bubble.wait_for_listing().await?;
    print_listing(&files);
    if !args.yes && !confirm("Download these files?")? {
        bubble.cancel();
        return Err(anyhow!("Download declined"));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            bubble.cancel();
            Err(anyhow!("Transfer cancelled"))
        }
        saved = download(&bubble, &output_dir) => saved,
    }
}

async fn download(bubble: &ReceiveFilesBubble, output_dir: &Path) -> Result<PathBuf> {
    let output = package(bubble.start().await?)?;
    let target = unique_path(&output_dir.join(sanitize(&output.name())?));
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create output directory: {}", parent.display())
        })?;
    }

    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;
    let written = output.write_to(&mut file).await;

    let state = bubble.wait_until_finished().await;
    if state.status != ReceiverStatus::Done {
        let reason = state
            .error
            .unwrap_or_else(|| format!("transfer ended as {}", state.status));
        return Err(anyhow!(reason));
    }
    let written = written?;
    info!("Wrote {} bytes to {}", written, target.display());
    println!("Saved {} ({} bytes)", target.display(), written);
    Ok(target)
}

/// Keeps only plain path components so a listing cannot escape the
/// output directory.
fn sanitize(name: &str) -> Result<PathBuf> {
    let path: PathBuf = Path::new(name)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if path.as_os_str().is_empty() {
        return Err(anyhow!("Invalid file name: {}", name));
    }
    Ok(path)
}

/// Appends ` (n)` to the file stem until the path is free.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1;
    loop {
        let name = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn print_listing(files: &[FileDescriptor]) {
    let total: u64 = files.iter().map(|f| f.size).sum();
    println!("Sender offers {} files ({} bytes):", files.len(), total);
    for file in files {
        println!("   {} ({} bytes, {})", file.full_path, file.size, file.mime_type);
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// One progress bar per listed file.
struct ReceiveProgress {
    id: String,
    verbose: bool,
    mp: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ReceiveProgress {
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

impl ReceiveFilesSubscriber for ReceiveProgress {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        if self.verbose {
            let _ = self.mp.println(format!("[DEBUG] {}", message));
        }
    }

    fn notify_listing(&self, event: ReceiveFilesListingEvent) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        for file in &event.files {
            let pb = self.mp.add(ProgressBar::new(file.size));
            pb.set_style(Self::bar_style());
            pb.set_message(format!("Waiting {}", file.full_path));
            bars.insert(file.full_path.clone(), pb);
        }
    }

    fn notify_receiving(&self, event: ReceiveFilesReceivingEvent) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pb) = bars.get(&event.full_path) else {
            debug!("No progress bar for {}", event.full_path);
            return;
        };
        pb.set_position(event.received);
        if event.received >= event.size {
            pb.finish_with_message(format!("[DONE] {}", event.full_path));
        } else {
            pb.set_message(format!("Receiving {}", event.full_path));
        }
    }

    fn notify_finished(&self, event: ReceiveFilesFinishedEvent) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        for pb in bars.values().filter(|pb| !pb.is_finished()) {
            pb.abandon();
        }
        if let Some(error) = event.error {
            let _ = self.mp.println(format!("[ERROR] {}", error));
        } else if event.status != ReceiverStatus::Done {
            let _ = self.mp.println(format!("Transfer ended: {}", event.status));
        }
    }
}
