//! Error types for autolxc-core

use autolxc_runtime::RuntimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] autolxc_config::ConfigError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container already exists: {0}")]
    NameCollision(String),

    #[error("Invalid container name: {0}")]
    InvalidName(String),

    #[error("Mount failed: {0}")]
    Mount(String),

    #[error("Copy failed: {0}")]
    Copy(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Bucket is closed")]
    BucketClosed,

    #[error("Failed to parse runtime output: {0}")]
    Parse(String),

    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Observer already registered: {0}")]
    ObserverExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runtime failures surface unwrapped so callers can match on
/// `RuntimeUnavailable` and `Timeout` directly.
impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(msg) => CoreError::RuntimeUnavailable(msg),
            RuntimeError::Timeout { command, timeout } => {
                CoreError::Timeout(format!("{} after {:?}", command, timeout))
            }
            RuntimeError::Download { url, reason } => {
                CoreError::Download(format!("{}: {}", url, reason))
            }
            RuntimeError::InvalidCommand(msg) => CoreError::InvalidState(msg),
            RuntimeError::IoError(e) => CoreError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_runtime_errors_map_unwrapped() {
        let e: CoreError = RuntimeError::Unavailable("lxc-start: not found".into()).into();
        assert!(matches!(e, CoreError::RuntimeUnavailable(_)));

        let e: CoreError = RuntimeError::Timeout {
            command: "lxc-start -n t1".into(),
            timeout: Duration::from_secs(1),
        }
        .into();
        match e {
            CoreError::Timeout(msg) => assert!(msg.contains("lxc-start -n t1")),
            other => panic!("unexpected {other:?}"),
        }

        let e: CoreError = RuntimeError::Download {
            url: "https://x".into(),
            reason: "404".into(),
        }
        .into();
        assert!(matches!(e, CoreError::Download(_)));
    }
}
