//! Settings for the tunnel engine.
//!
//! Stored as JSON at `~/.podforward/config.json`. Every field is optional in
//! the file; missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::domain::LogLevel;
use crate::error::{Error, Result};
use crate::spdy::ConnectionOptions;

/// User settings, stored in JSON format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Namespace used by the CLI when none is given.
    pub default_namespace: String,

    /// IP address local listeners bind to when only a port is given.
    pub bind_address: String,

    /// How long to wait for the pod side to accept a new stream.
    pub stream_reply_timeout_ms: u64,

    /// How long to wait for an error-stream diagnosis after a connection ends.
    pub error_stream_grace_ms: u64,

    /// How long closing a transport may spend flushing before it drops the socket.
    pub close_grace_ms: u64,

    /// Worker threads of the engine runtime. `None` uses one per core.
    pub worker_threads: Option<usize>,

    pub log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            bind_address: "127.0.0.1".to_string(),
            stream_reply_timeout_ms: 30_000,
            error_stream_grace_ms: 1_000,
            close_grace_ms: 1_000,
            worker_threads: None,
            log_level: LogLevel::Info,
        }
    }
}

impl Settings {
    /// The timing knobs the tunnel engine needs.
    pub fn tunnel(&self) -> TunnelSettings {
        TunnelSettings {
            stream_reply_timeout: Duration::from_millis(self.stream_reply_timeout_ms),
            error_stream_grace: Duration::from_millis(self.error_stream_grace_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
        }
    }
}

/// Timeouts applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSettings {
    pub stream_reply_timeout: Duration,
    pub error_stream_grace: Duration,
    pub close_grace: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Settings::default().tunnel()
    }
}

impl TunnelSettings {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            reply_timeout: self.stream_reply_timeout,
            close_grace: self.close_grace,
        }
    }
}

/// Reads and writes [`Settings`].
pub struct SettingsStore {
    /// Path to the settings file.
    config_path: PathBuf,
}

impl SettingsStore {
    /// Create a store at the default path, `~/.podforward/config.json`.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

        Ok(Self {
            config_path: home.join(".podforward").join("config.json"),
        })
    }

    /// Create a store with a custom path.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load settings from disk.
    ///
    /// Returns defaults if the file doesn't exist.
    pub async fn load(&self) -> Result<Settings> {
        if !fs::try_exists(&self.config_path).await.unwrap_or(false) {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read settings: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {}", e)))
    }

    /// Save settings to disk, creating the directory if needed.
    pub async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        // Write atomically by writing to temp file then renaming
        let temp_path = self.config_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to create temp settings file: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::Config(format!("Failed to write settings: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| Error::Config(format!("Failed to sync settings: {}", e)))?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to rename settings file: {}", e)))?;

        Ok(())
    }
}
