//! Runtime plumbing for autolxc
//!
//! This crate provides the two external seams the container core talks through:
//! a [`CommandRunner`] that executes `lxc-*` tools and a [`Fetcher`] that copies
//! the base image to local disk. It also knows the argv of every LXC command.

mod cli_runner;
mod error;
mod fetch;
mod lxc;
mod types;

pub use cli_runner::CliRunner;
pub use error::*;
pub use fetch::{FileFetcher, HttpFetcher};
pub use lxc::*;
pub use types::*;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Executes commands against the container runtime
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion and capture its output.
    ///
    /// A non-zero exit is not an error at this layer; callers inspect
    /// [`CommandOutput::exit_code`]. Errors are reserved for a runtime that
    /// cannot be reached and for timeouts.
    async fn run(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;
}

/// Copies a remote artifact to a local path
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Create the command runner described by the global config
pub fn create_runner(config: &autolxc_config::GlobalConfig) -> Arc<dyn CommandRunner> {
    if config.runtime.use_sudo {
        Arc::new(CliRunner::sudo())
    } else {
        Arc::new(CliRunner::new())
    }
}

/// Pick a fetcher for a URL scheme: `file://` and bare paths are copied,
/// everything else goes over HTTP
pub fn create_fetcher(url: Option<&str>, timeout: Duration) -> Arc<dyn Fetcher> {
    match url {
        Some(u) if u.starts_with("http://") || u.starts_with("https://") => {
            Arc::new(HttpFetcher::new(timeout))
        }
        Some(_) => Arc::new(FileFetcher),
        None => Arc::new(HttpFetcher::new(timeout)),
    }
}
