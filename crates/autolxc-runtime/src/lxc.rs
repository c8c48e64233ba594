//! argv builders for the `lxc-*` tools
//!
//! All commands are scoped to one LXC path (`-P`), which is where the base
//! container and every clone live.

use std::path::{Path, PathBuf};

/// Backing store used for snapshot clones
const SNAPSHOT_BACKING_STORE: &str = "overlayfs";

/// LXC commands rooted at one container path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lxc {
    path: PathBuf,
}

impl Lxc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding a container's `config` and `rootfs`
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn base(&self, tool: &str) -> Vec<String> {
        vec![
            tool.to_string(),
            "-P".to_string(),
            self.path.to_string_lossy().to_string(),
        ]
    }

    fn named(&self, tool: &str, name: &str) -> Vec<String> {
        let mut args = self.base(tool);
        args.push("-n".to_string());
        args.push(name.to_string());
        args
    }

    /// `NAME STATE` listing of every container under the path
    pub fn list(&self) -> Vec<String> {
        let mut args = self.base("lxc-ls");
        args.extend(["--fancy", "--fancy-format", "name,state"].map(String::from));
        args
    }

    pub fn start(&self, name: &str) -> Vec<String> {
        let mut args = self.named("lxc-start", name);
        args.push("-d".to_string());
        args
    }

    /// Block until the container reaches `state` or `timeout_secs` elapses
    pub fn wait(&self, name: &str, state: &str, timeout_secs: u64) -> Vec<String> {
        let mut args = self.named("lxc-wait", name);
        args.extend(["-s".to_string(), state.to_string()]);
        args.extend(["-t".to_string(), timeout_secs.to_string()]);
        args
    }

    pub fn stop(&self, name: &str, timeout_secs: u64) -> Vec<String> {
        let mut args = self.named("lxc-stop", name);
        args.extend(["-t".to_string(), timeout_secs.to_string()]);
        args
    }

    /// Forced destroy; also stops a running container
    pub fn destroy(&self, name: &str) -> Vec<String> {
        let mut args = self.named("lxc-destroy", name);
        args.push("-f".to_string());
        args
    }

    /// Clone `src` (living under `src_path`) to `new_name` under this path
    pub fn copy(&self, src_path: &Path, src: &str, new_name: &str, snapshot: bool) -> Vec<String> {
        let mut args = vec![
            "lxc-copy".to_string(),
            "-P".to_string(),
            src_path.to_string_lossy().to_string(),
            "-n".to_string(),
            src.to_string(),
            "-p".to_string(),
            self.path.to_string_lossy().to_string(),
            "-N".to_string(),
            new_name.to_string(),
        ];
        if snapshot {
            args.push("-s".to_string());
            args.push("-B".to_string());
            args.push(SNAPSHOT_BACKING_STORE.to_string());
        }
        args
    }

    /// Run `cmd` inside a running container
    pub fn attach<S: AsRef<str>>(&self, name: &str, cmd: &[S]) -> Vec<String> {
        let mut args = self.named("lxc-attach", name);
        args.push("--".to_string());
        args.extend(cmd.iter().map(|c| c.as_ref().to_string()));
        args
    }

    /// Print only the state line of `lxc-info`
    pub fn info_state(&self, name: &str) -> Vec<String> {
        let mut args = self.named("lxc-info", name);
        args.push("-s".to_string());
        args
    }
}

/// Extract the state from `lxc-info -s` output (`State:   RUNNING`)
pub fn parse_info_state(output: &str) -> Option<&str> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("state") {
            Some(value.trim()).filter(|v| !v.is_empty())
        } else {
            None
        }
    })
}
