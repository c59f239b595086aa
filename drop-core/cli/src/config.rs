use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Address a sender listens on when neither `--bind` nor the config names
/// one.
pub const DEFAULT_BIND: &str = "0.0.0.0:7878";

/// Persistent preferences for the CLI.
///
/// Stored as TOML under the platform config directory:
/// - Linux: `$XDG_CONFIG_HOME/peerdrop/config.toml` or
///   `$HOME/.config/peerdrop/config.toml`
/// - macOS: `$HOME/Library/Application Support/peerdrop/config.toml`
/// - Windows: `%APPDATA%\peerdrop\config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_receive_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

impl CliConfig {
    pub fn config_file() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Unable to determine config directory"))?;
        Ok(dir.join("peerdrop").join("config.toml"))
    }

    /// Loads the user's configuration, or the defaults if none was saved.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).with_context(|| {
            format!("Failed to read config file: {}", path.display())
        })?;
        toml::from_str(&content).with_context(|| {
            format!("Failed to parse config file: {}", path.display())
        })
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    /// Writes the configuration, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create config directory: {}", dir.display())
            })?;
        }
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(path, content).with_context(|| {
            format!("Failed to write config file: {}", path.display())
        })
    }

    /// Directory downloads go to when `--output` is not given.
    pub fn receive_dir(&self) -> PathBuf {
        match &self.default_receive_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_receive_dir_fallback(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        self.default_bind.as_deref().unwrap_or(DEFAULT_BIND)
    }
}

/// `~/Downloads/PeerDrop`, or the working directory when there is no home.
fn default_receive_dir_fallback() -> PathBuf {
    if let Some(downloads) = dirs::download_dir() {
        return downloads.join("PeerDrop");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join("Downloads").join("PeerDrop");
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
