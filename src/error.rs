//! Error types for runtime supervision and model provisioning

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the supervisor, the download coordinator and the runtime client
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime executable does not exist at the resolved path
    #[error("Runtime executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    /// The OS refused to spawn the runtime process
    #[error("Failed to spawn runtime process {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure talking to the runtime HTTP surface
    #[error("Runtime request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The runtime answered with a non-success status
    #[error("Runtime returned HTTP {status}: {body}")]
    ServerStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The runtime never answered within its startup window
    #[error("Runtime at {url} not ready after {timeout:?}")]
    NotReady { url: String, timeout: Duration },

    /// The runtime reported an error inside a progress stream
    #[error("Pull failed: {0}")]
    Pull(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
