//! Command runner backed by local processes
//!
//! Every `lxc-*` tool is invoked directly, optionally behind a prefix such as
//! `sudo -n` when the LXC path is root-owned.

use crate::{display_command, CommandOutput, CommandRunner, Result, RuntimeError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs commands as child processes of this one
#[derive(Debug, Clone, Default)]
pub struct CliRunner {
    /// Optional prefix (e.g., ["sudo", "-n"])
    cmd_prefix: Vec<String>,
}

impl CliRunner {
    /// Create a runner that executes commands as-is
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runner that prefixes every command with non-interactive sudo
    pub fn sudo() -> Self {
        Self::with_prefix(vec!["sudo".to_string(), "-n".to_string()])
    }

    pub fn with_prefix(cmd_prefix: Vec<String>) -> Self {
        Self { cmd_prefix }
    }

    /// Build a command with the correct prefix.
    fn build_command(&self, argv: &[String]) -> Result<Command> {
        let full: Vec<&String> = self.cmd_prefix.iter().chain(argv.iter()).collect();
        let (program, args) = full
            .split_first()
            .ok_or_else(|| RuntimeError::InvalidCommand("empty argv".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn run(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Err(RuntimeError::InvalidCommand("empty argv".to_string()));
        }

        let mut cmd = self.build_command(argv)?;
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave the child behind.
            .kill_on_drop(true);

        tracing::debug!("Running: {}", display_command(argv));

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::Unavailable(format!("{}: {}", argv[0], e))
            } else {
                RuntimeError::IoError(e)
            }
        })?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RuntimeError::Timeout {
                    command: display_command(argv),
                    timeout: limit,
                })??,
            None => child.wait_with_output().await?,
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        // Behind a prefix the spawn succeeds even when the tool is missing;
        // the prefix reports it instead (sudo exits 1, shells exit 127).
        if !self.cmd_prefix.is_empty() && reports_missing_program(&argv[0], &result) {
            return Err(RuntimeError::Unavailable(format!(
                "{}: {}",
                argv[0],
                result.stderr.trim()
            )));
        }

        if !result.success() {
            tracing::debug!(
                "Command exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}

fn reports_missing_program(program: &str, output: &CommandOutput) -> bool {
    matches!(output.exit_code, 1 | 127)
        && output
            .stderr
            .lines()
            .any(|line| line.contains(program) && line.contains("not found"))
}
