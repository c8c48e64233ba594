//! A single LXC test container and its lifecycle operations
//!
//! State only changes after the runtime has confirmed the operation, so a
//! failed or timed-out call leaves the container exactly as it was.

use crate::archive;
use crate::{ContainerIdentity, CoreError, LifecycleEvent, ObserverRegistry, Result};
use autolxc_runtime::{display_command, CommandOutput, CommandRunner, Fetcher, Lxc};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Autotest install location inside a container
pub const CONTAINER_AUTOTEST_DIR: &str = "/usr/local/autotest";

/// Where control files are dropped inside a container
pub const CONTROL_FILES_DIR: &str = "/usr/local/autotest/control_files";

/// `lxc-wait` bound when the container has no command timeout
const DEFAULT_START_WAIT_SECS: u64 = 60;

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A host directory bound into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    /// The `lxc.mount.entry` line; LXC wants the target relative to the rootfs
    /// and creates the mount point on the mounted rootfs at start
    pub fn config_entry(&self) -> String {
        let options = if self.read_only {
            "bind,ro,create=dir"
        } else {
            "bind,create=dir"
        };
        format!(
            "lxc.mount.entry = {} {} none {} 0 0",
            self.source.display(),
            rootfs_relative(&self.target).display(),
            options
        )
    }
}

/// Strip the root so a container path can be joined onto a rootfs
fn rootfs_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

/// The writable rootfs named by an LXC config.
///
/// Plain `dir` backed containers name a directory, possibly as `dir:<path>`.
/// Overlay snapshots name `overlay:<lower>:<upper>`; writes belong in the
/// upper layer, which is the last component.
fn rootfs_from_config(config: &str) -> Option<PathBuf> {
    config.lines().rev().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        match key.trim() {
            "lxc.rootfs.path" | "lxc.rootfs" => {
                let value = value.trim();
                let path = value.rsplit(':').next().unwrap_or(value);
                (!path.is_empty()).then(|| PathBuf::from(path))
            }
            _ => None,
        }
    })
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Everything a container needs to talk to the runtime
#[derive(Clone)]
pub struct RuntimeContext {
    pub lxc: Lxc,
    pub runner: Arc<dyn CommandRunner>,
    pub observers: Arc<ObserverRegistry>,
    pub command_timeout: Option<Duration>,
    pub stop_timeout: Duration,
}

impl RuntimeContext {
    pub fn new(lxc_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            lxc: Lxc::new(lxc_path),
            runner,
            observers: Arc::new(ObserverRegistry::new()),
            command_timeout: None,
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_observers(mut self, observers: Arc<ObserverRegistry>) -> Self {
        self.observers = observers;
        self
    }

    pub fn with_timeouts(mut self, command_timeout: Option<Duration>, stop_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self.stop_timeout = stop_timeout;
        self
    }
}

/// One container instance
pub struct Container {
    identity: ContainerIdentity,
    state: ContainerState,
    mounts: Vec<Mount>,
    created_at: DateTime<Utc>,
    timeout: Option<Duration>,
    ctx: RuntimeContext,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("mounts", &self.mounts)
            .field("lxc_path", &self.ctx.lxc.path())
            .finish()
    }
}

impl Container {
    /// Wrap a container that already exists in the runtime
    pub fn new(identity: ContainerIdentity, state: ContainerState, ctx: RuntimeContext) -> Self {
        Self {
            identity,
            state,
            mounts: Vec::new(),
            created_at: Utc::now(),
            timeout: ctx.command_timeout,
            ctx,
        }
    }

    /// Date an adopted container by something older than this process
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.identity
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn lxc_name(&self) -> String {
        self.identity.lxc_name()
    }

    /// LXC path the container lives under
    pub fn lxc_path(&self) -> &Path {
        self.ctx.lxc.path()
    }

    pub fn container_dir(&self) -> PathBuf {
        self.ctx.lxc.container_dir(&self.lxc_name())
    }

    /// Host directory that backs the container's root filesystem.
    ///
    /// Read from `lxc.rootfs.path` in the container config, falling back to
    /// `<container_dir>/rootfs` when the config does not name one.
    pub fn rootfs(&self) -> PathBuf {
        std::fs::read_to_string(self.config_path())
            .ok()
            .and_then(|config| rootfs_from_config(&config))
            .unwrap_or_else(|| self.container_dir().join("rootfs"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.container_dir().join("config")
    }

    /// Timeout applied to every runtime call made for this container
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn notify(&self, event: LifecycleEvent) {
        self.ctx.observers.notify(&event);
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        Ok(self.ctx.runner.run(argv, None, self.timeout).await?)
    }

    /// Run and treat a non-zero exit as a failure
    async fn run_checked(&self, argv: Vec<String>) -> Result<CommandOutput> {
        let output = self.run(&argv).await?;
        if !output.success() {
            return Err(CoreError::CommandFailed {
                command: display_command(&argv),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn require_not_destroyed(&self, op: &str) -> Result<()> {
        if self.state == ContainerState::Destroyed {
            return Err(CoreError::InvalidState(format!(
                "cannot {} destroyed container {}",
                op, self.identity
            )));
        }
        Ok(())
    }

    /// Start the container and wait for it to reach RUNNING
    pub async fn start(&mut self) -> Result<()> {
        self.require_not_destroyed("start")?;
        if self.state == ContainerState::Running {
            return Ok(());
        }

        let name = self.lxc_name();
        tracing::debug!("Starting container {}", name);
        self.run_checked(self.ctx.lxc.start(&name)).await?;

        let wait_secs = self
            .timeout
            .map(|t| t.as_secs().max(1))
            .unwrap_or(DEFAULT_START_WAIT_SECS);
        self.run_checked(self.ctx.lxc.wait(&name, "RUNNING", wait_secs))
            .await?;

        self.state = ContainerState::Running;
        self.notify(LifecycleEvent::Started(self.identity.clone()));
        Ok(())
    }

    /// Stop a running container; a no-op for containers that are not running
    pub async fn stop(&mut self) -> Result<()> {
        self.require_not_destroyed("stop")?;
        if self.state != ContainerState::Running {
            return Ok(());
        }

        let name = self.lxc_name();
        tracing::debug!("Stopping container {}", name);
        self.run_checked(self.ctx.lxc.stop(&name, self.ctx.stop_timeout.as_secs()))
            .await?;

        self.state = ContainerState::Stopped;
        self.notify(LifecycleEvent::Stopped(self.identity.clone()));
        Ok(())
    }

    /// Destroy the container and forget its mounts. Idempotent.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state == ContainerState::Destroyed {
            return Ok(());
        }
        if self.state == ContainerState::Running {
            self.stop().await?;
        }

        let name = self.lxc_name();
        tracing::debug!("Destroying container {}", name);
        self.run_checked(self.ctx.lxc.destroy(&name)).await?;

        self.mounts.clear();
        self.state = ContainerState::Destroyed;
        self.notify(LifecycleEvent::Destroyed(self.identity.clone()));
        Ok(())
    }

    /// Run a command inside the running container.
    ///
    /// The command's own exit code is returned in the output, not as an error.
    pub async fn attach_run<S: AsRef<str>>(&self, cmd: &[S]) -> Result<CommandOutput> {
        if self.state != ContainerState::Running {
            return Err(CoreError::InvalidState(format!(
                "container {} is {}, not running",
                self.identity, self.state
            )));
        }
        if cmd.is_empty() {
            return Err(CoreError::InvalidState("no command given".to_string()));
        }

        self.run(&self.ctx.lxc.attach(&self.lxc_name(), cmd)).await
    }

    /// Bind `source` on the host to `target` in the container.
    ///
    /// The entry is written to the container config and takes effect on the
    /// next start.
    pub async fn add_mount(
        &mut self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        read_only: bool,
    ) -> Result<()> {
        let source = source.as_ref();
        let target = target.as_ref();

        if self.state == ContainerState::Destroyed {
            return Err(CoreError::Mount(format!(
                "container {} is destroyed",
                self.identity
            )));
        }
        if !source.exists() {
            return Err(CoreError::Mount(format!(
                "source {} does not exist",
                source.display()
            )));
        }
        if !source.is_dir() {
            return Err(CoreError::Mount(format!(
                "source {} is not a directory",
                source.display()
            )));
        }
        if has_parent_component(target) || rootfs_relative(target).as_os_str().is_empty() {
            return Err(CoreError::Mount(format!(
                "invalid target {}",
                target.display()
            )));
        }

        let mount = Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            read_only,
        };

        let mount_point = self.rootfs().join(rootfs_relative(target));
        tokio::fs::create_dir_all(&mount_point).await.map_err(|e| {
            CoreError::Mount(format!("failed to create {}: {}", mount_point.display(), e))
        })?;
        append_config_line(&self.config_path(), &mount.config_entry())
            .await
            .map_err(|e| CoreError::Mount(format!("failed to update config: {}", e)))?;

        tracing::debug!("{}: {}", self.identity, mount.config_entry());
        self.notify(LifecycleEvent::MountAdded {
            identity: self.identity.clone(),
            target: target.display().to_string(),
        });
        self.mounts.push(mount);
        Ok(())
    }

    /// Re-read the state from the runtime
    pub async fn refresh_status(&mut self) -> Result<ContainerState> {
        if self.state == ContainerState::Destroyed {
            return Ok(self.state);
        }

        let name = self.lxc_name();
        let argv = self.ctx.lxc.info_state(&name);
        let output = self.run(&argv).await?;
        if !output.success() {
            if output.stderr.contains("doesn't exist") || output.stderr.contains("does not exist") {
                return Err(CoreError::NotFound(name));
            }
            return Err(CoreError::CommandFailed {
                command: display_command(&argv),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let raw = autolxc_runtime::parse_info_state(&output.stdout)
            .ok_or_else(|| CoreError::Parse(format!("no state in lxc-info output for {}", name)))?;
        let observed = crate::factory::parse_runtime_state(raw)?;

        // A never-started container reports STOPPED; keep it CREATED.
        if !(observed == ContainerState::Stopped && self.state == ContainerState::Created) {
            self.state = observed;
        }
        Ok(self.state)
    }

    /// Set the hostname of a running container
    pub async fn set_hostname(&self, hostname: &str) -> Result<()> {
        if self.state != ContainerState::Running {
            return Err(CoreError::InvalidState(format!(
                "hostname can only be set on a running container ({} is {})",
                self.identity, self.state
            )));
        }
        let valid = !hostname.is_empty()
            && hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid {
            return Err(CoreError::InvalidName(format!("bad hostname '{}'", hostname)));
        }

        let script = format!("echo {0} > /etc/hostname && hostname {0}", hostname);
        let argv = self.ctx.lxc.attach(&self.lxc_name(), &["sh", "-c", script.as_str()]);
        self.run_checked(argv).await?;
        Ok(())
    }

    /// Copy a host file or directory into the container filesystem
    pub async fn copy_into(&self, src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<PathBuf> {
        self.require_not_destroyed("copy into")?;
        let src = src.as_ref().to_path_buf();
        let dest = dest.as_ref();
        if !src.exists() {
            return Err(CoreError::Copy(format!("{} does not exist", src.display())));
        }
        if has_parent_component(dest) {
            return Err(CoreError::Copy(format!("invalid destination {}", dest.display())));
        }

        let host_dest = self.rootfs().join(rootfs_relative(dest));
        let target = host_dest.clone();
        tokio::task::spawn_blocking(move || copy_recursively(&src, &target))
            .await
            .map_err(|e| CoreError::Copy(e.to_string()))?
            .map_err(|e| CoreError::Copy(e.to_string()))?;
        Ok(host_dest)
    }

    /// Drop a control file into the container's control file directory
    pub async fn install_control_file(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .ok_or_else(|| CoreError::Copy(format!("{} has no file name", path.display())))?;
        self.copy_into(path, Path::new(CONTROL_FILES_DIR).join(file_name))
            .await
    }

    /// Fetch a server-side package tarball and unpack it over the container's
    /// autotest directory
    pub async fn install_ssp(&self, fetcher: &dyn Fetcher, url: &str) -> Result<()> {
        self.require_not_destroyed("install ssp into")?;

        let scratch = tempfile::tempdir()?;
        let archive_path = scratch.path().join("ssp.tar");
        fetcher.fetch(url, &archive_path).await?;

        let dest = self.rootfs().join(rootfs_relative(Path::new(CONTAINER_AUTOTEST_DIR)));
        tokio::task::spawn_blocking(move || archive::unpack_file(&archive_path, &dest))
            .await
            .map_err(|e| CoreError::Download(e.to_string()))?
            .map_err(|e| CoreError::Download(format!("{}: {}", url, e)))?;

        tracing::info!("Installed server-side package {} into {}", url, self.identity);
        Ok(())
    }
}

async fn append_config_line(config: &Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = config.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await
}

fn copy_recursively(src: &Path, dest: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
    }
    Ok(())
}
