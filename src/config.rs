use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::Context as _;
use serde::Deserialize;

use crate::foundation::error::FramecastResult;

/// Process configuration, loaded from a TOML file. Every field has a default, so an empty file
/// (or no file at all) is a valid configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub scanner: ScannerConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub catalog_path: PathBuf,
    /// Most recent stream sessions kept in the log.
    pub session_log_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("./catalog.db"),
            session_log_limit: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScannerConfig {
    pub source_dir: PathBuf,
    pub cache_root: PathBuf,
    /// Cached assets allowed per resolution.
    pub cache_limit: usize,
    pub scan_interval_secs: u64,
    pub stale_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("./gifs"),
            cache_root: PathBuf::from("./cache"),
            cache_limit: 20,
            scan_interval_secs: 300,
            stale_secs: 3600,
        }
    }
}

impl ScannerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Frames per second used to pace stream sends.
    pub target_fps: f64,
    pub command_timeout_secs: u64,
    /// Side length of QR clock frames.
    pub clock_size: u32,
    /// Upper bound on clock ticks per connection (one per second).
    pub clock_max_ticks: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8766,
            target_fps: 15.0,
            command_timeout_secs: 10,
            clock_size: 32,
            clock_max_ticks: 60 * 60 * 24,
        }
    }
}

impl ServerConfig {
    pub fn frame_interval(&self) -> Duration {
        if self.target_fps.is_finite() && self.target_fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.target_fps)
        } else {
            Duration::ZERO
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub width: u32,
    pub height: u32,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub base_read_timeout_ms: u64,
    /// Added to the read timeout for every retry already spent.
    pub read_timeout_step_ms: u64,
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8766,
            width: 32,
            height: 32,
            connect_timeout_ms: 10_000,
            reply_timeout_ms: 5_000,
            base_read_timeout_ms: 3_000,
            read_timeout_step_ms: 200,
            max_retries: 10,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Per-read timeout after `retries` failed attempts; grows linearly and is never capped.
    pub fn read_timeout(&self, retries: u32) -> Duration {
        Duration::from_millis(
            self.base_read_timeout_ms
                .saturating_add(u64::from(retries).saturating_mul(self.read_timeout_step_ms)),
        )
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    pub fn load(path: &Path) -> FramecastResult<Self> {
        let toml_str = fs::read_to_string(path)
            .with_context(|| format!("read config '{}'", path.display()))?;
        Self::from_toml(&toml_str)
    }

    pub fn from_toml(toml_str: &str) -> FramecastResult<Self> {
        let config: Config = toml::from_str(toml_str).context("parse config TOML")?;
        Ok(config)
    }
}
