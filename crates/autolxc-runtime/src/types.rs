//! Common types for command execution

use serde::{Deserialize, Serialize};

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, -1 if the process was killed by a signal
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// A successful run that printed `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(stdout, "", 0)
    }

    /// A failed run that printed `stderr`
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::new("", stderr, exit_code)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Render an argv for log lines and error messages
pub fn display_command(argv: &[String]) -> String {
    argv.join(" ")
}
