//! peerdrop command line interface.
//!
//! Sends and receives files over plain TCP using the PeerDrop protocol.
//!
//! - `peerdrop send [--password P] [--bind ADDR] [--chunk-size N] PATHS...`
//!   publishes files and directories until Ctrl+C, serving any number of
//!   receivers.
//! - `peerdrop receive ADDR [--password P] [--output DIR] [--save-dir]
//!   [--yes]` downloads what a sender offers. Several files are saved as
//!   one tar archive.
//! - `peerdrop config show | set-receive-dir DIR | clear-receive-dir`
//!   manages the persistent settings in [`CliConfig`].
//!
//! Logging goes through `tracing`. `RUST_LOG` selects the filter; without
//! it, `--verbose` enables debug output and the default is `warn`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;
mod receive;
mod send;
pub mod tcp;

pub use config::{CliConfig, DEFAULT_BIND};
pub use receive::{cli_metadata, run_receive};
pub use send::{DiskData, collect_files, run_send};

#[derive(Parser, Debug)]
#[clap(name = "peerdrop", version)]
#[clap(about = "Send and receive files directly between peers", long_about = None)]
pub struct Cli {
    #[clap(short, long, global = true, help = "Print debug logs")]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Share files and directories with receivers
    Send(SendArgs),
    /// Download the files a sender offers
    Receive(ReceiveArgs),
    /// Show or change saved settings
    #[clap(subcommand)]
    Config(ConfigCommand),
}

#[derive(Clone, Debug, Args)]
pub struct SendArgs {
    #[clap(short, long, help = "Password receivers must present")]
    pub password: Option<String>,
    #[clap(short, long, help = "Address to listen on")]
    pub bind: Option<String>,
    #[clap(long, help = "Largest chunk in bytes")]
    pub chunk_size: Option<u64>,
    #[clap(value_parser, required = true, help = "Files or directories to send")]
    pub paths: Vec<PathBuf>,
}

#[derive(Clone, Debug, Args)]
pub struct ReceiveArgs {
    #[clap(value_parser, help = "Sender address, e.g. 192.168.1.20:7878")]
    pub addr: String,
    #[clap(short, long, help = "Password set by the sender")]
    pub password: Option<String>,
    #[clap(short, long, help = "Directory to save into")]
    pub output: Option<PathBuf>,
    #[clap(long, help = "Remember the output directory as the default")]
    pub save_dir: bool,
    #[clap(short, long, help = "Download without asking")]
    pub yes: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the current settings
    Show,
    /// Set the default receive directory
    SetReceiveDir { dir: PathBuf },
    /// Forget the default receive directory
    ClearReceiveDir,
}

/// Parses the process arguments and runs the selected command.
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli).await
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = CliConfig::load()?;
    match cli.command {
        Command::Send(args) => run_send(args, &config, cli.verbose).await,
        Command::Receive(args) => {
            run_receive(args, &mut config, cli.verbose).await.map(|_| ())
        }
        Command::Config(command) => run_config(command, &mut config),
    }
}

fn run_config(command: ConfigCommand, config: &mut CliConfig) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("Config file: {}", CliConfig::config_file()?.display());
            match &config.default_receive_dir {
                Some(dir) => println!("Default receive directory: {}", dir),
                None => println!(
                    "Default receive directory: (not set, using {})",
                    config.receive_dir().display()
                ),
            }
            println!("Default bind address: {}", config.bind_addr());
            match config.chunk_size {
                Some(size) => println!("Chunk size: {} bytes", size),
                None => println!("Chunk size: (default)"),
            }
        }
        ConfigCommand::SetReceiveDir { dir } => {
            config.default_receive_dir = Some(dir.to_string_lossy().into_owned());
            config.save()?;
            println!("Default receive directory set to {}", dir.display());
        }
        ConfigCommand::ClearReceiveDir => {
            config.default_receive_dir = None;
            config.save()?;
            println!("Default receive directory cleared");
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
