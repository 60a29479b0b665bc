//! Configuration management for the service.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::models::PLACEHOLDER_IMAGE;

/// Main configuration for the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for storing data
    pub data_dir: PathBuf,

    /// Path to SQLite database
    pub db_path: PathBuf,

    /// Address to bind the HTTP server to
    pub host: String,

    /// HTTP port for the API
    pub http_port: u16,

    /// Log level
    pub log_level: String,

    /// Allowed CORS origins; empty allows any origin
    pub cors_origins: Vec<String>,

    /// Image stored for runs submitted without one
    pub placeholder_image: String,

    /// Write deadline for a single WebSocket frame
    pub ws_write_timeout_secs: u64,

    /// Keep-alive interval for SSE streams
    pub sse_keep_alive_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("trichter");

        Self {
            db_path: data_dir.join("runs.db"),
            data_dir,
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            log_level: "info".to_string(),
            cors_origins: vec!["https://trichter.hauptspeicher.com".to_string()],
            placeholder_image: PLACEHOLDER_IMAGE.to_string(),
            ws_write_timeout_secs: 10,
            sse_keep_alive_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure all directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Apply overrides from the environment (`REST_PORT`).
    pub fn apply_env(&mut self) {
        self.apply_port(std::env::var("REST_PORT").ok());
    }

    fn apply_port(&mut self, value: Option<String>) {
        let Some(value) = value else {
            return;
        };
        match value.parse() {
            Ok(port) => self.http_port = port,
            Err(_) => warn!("Ignoring invalid REST_PORT value {:?}", value),
        }
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trichter")
            .join("config.json")
    }

    pub fn ws_write_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_write_timeout_secs.max(1))
    }

    pub fn sse_keep_alive(&self) -> Duration {
        Duration::from_secs(self.sse_keep_alive_secs.max(1))
    }
}
