//! Daemon configuration.
//!
//! Stored as TOML at `$CHUNKFERRY_CONFIG`, or by default:
//! - Linux: `~/.config/chunkferry/server.toml`
//! - Windows: `%APPDATA%/chunkferry/server.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chunkferry_receiver::ReceiverConfig;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CHUNKFERRY_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Working directory for chunk stores. `~` is expanded.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// Where completed uploads are stored. `~` is expanded.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Port of the multipart HTTP endpoint.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port of the WebSocket channel endpoint.
    #[serde(default = "default_channel_port")]
    pub channel_port: u16,

    /// Sessions with no chunk for this many seconds are cancelled.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Completed uploads answer resent chunks for this many seconds.
    #[serde(default = "default_completion_ttl_secs")]
    pub completion_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Write a `.hash` file next to each stored upload.
    #[serde(default = "default_true")]
    pub write_hash_sidecar: bool,
}

fn default_root_dir() -> String {
    "~/.cache/chunkferry".into()
}

fn default_output_dir() -> String {
    "~/chunkferry".into()
}

fn default_http_port() -> u16 {
    8080
}

fn default_channel_port() -> u16 {
    8081
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_completion_ttl_secs() -> u64 {
    10 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            output_dir: default_output_dir(),
            http_port: default_http_port(),
            channel_port: default_channel_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
            completion_ttl_secs: default_completion_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            write_hash_sidecar: default_true(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Receiver settings with paths expanded.
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            write_hash_sidecar: self.write_hash_sidecar,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            completion_ttl: Duration::from_secs(self.completion_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            ..ReceiverConfig::new(expand_path(&self.root_dir), expand_path(&self.output_dir))
        }
    }
}

/// Expands a leading `~/` to `$HOME`.
fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chunkferry").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("chunkferry")
            .join("server.toml")
    }
}
