//! Error types for the runtime layer

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
