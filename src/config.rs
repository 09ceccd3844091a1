//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Loopback address the runtime binds to
    pub host: String,
    pub port: u16,
    /// Directory holding the runtime executable
    pub bin_dir: PathBuf,
    /// Passed to the runtime as its model storage directory
    pub models_dir: PathBuf,
    /// How long the runtime keeps a model loaded after the last request
    pub keep_alive: String,
    pub shutdown_grace_ms: u64,
    /// Delay between a completed pull and re-reading the installed list
    pub settle_delay_ms: u64,
    pub startup_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_file: Option<PathBuf>,
    pub state_file: PathBuf,
    /// Serve Prometheus metrics on this port when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bin_dir: default_bin_dir(),
            models_dir: default_data_dir().join("models"),
            keep_alive: default_keep_alive(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            startup_timeout_secs: default_startup_timeout_secs(),
            catalog_file: None,
            state_file: default_data_dir().join("state.toml"),
            metrics_port: None,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("OLLAMA_MANAGER_PORT") {
            config.port = port.parse().context("Invalid OLLAMA_MANAGER_PORT value")?;
        }
        if let Ok(bin_dir) = std::env::var("OLLAMA_MANAGER_BIN_DIR") {
            config.bin_dir = PathBuf::from(bin_dir);
        }
        if let Ok(models_dir) = std::env::var("OLLAMA_MANAGER_MODELS_DIR") {
            config.models_dir = PathBuf::from(models_dir);
        }
        if let Ok(state_file) = std::env::var("OLLAMA_MANAGER_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(catalog) = std::env::var("OLLAMA_MANAGER_CATALOG") {
            config.catalog_file = Some(PathBuf::from(catalog));
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Runtime port must be non-zero");
        }
        if self.host.trim().is_empty() {
            anyhow::bail!("Runtime host cannot be empty");
        }
        if self.keep_alive.trim().is_empty() {
            anyhow::bail!("keep_alive cannot be empty");
        }
        if self.shutdown_grace_ms == 0 {
            anyhow::bail!("shutdown_grace_ms must be greater than zero");
        }
        if let Some(metrics_port) = self.metrics_port
            && metrics_port == self.port
        {
            anyhow::bail!(
                "Metrics port {} conflicts with runtime port",
                metrics_port
            );
        }

        // Ensure state file directory exists or can be created
        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        Ok(())
    }

    /// `host:port` as handed to the runtime
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL of the runtime HTTP surface
    pub fn server_address(&self) -> String {
        format!("http://{}", self.bind_address())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

// Default functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    15537
}
fn default_bin_dir() -> PathBuf {
    PathBuf::from("resources/ollama")
}
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ollama-manager"))
        .unwrap_or_else(|| PathBuf::from(".ollama-manager"))
}
fn default_keep_alive() -> String {
    "5m".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_settle_delay_ms() -> u64 {
    2000
}
fn default_startup_timeout_secs() -> u64 {
    30
}
