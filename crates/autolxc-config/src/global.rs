//! Global configuration for autolxc
//!
//! Located at `~/.config/autolxc/config.toml`

use crate::{ConfigError, MountSpec, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global autolxc configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub container: ContainerConfig,
    pub runtime: RuntimeConfig,
    /// Bind mounts applied to every container cloned from the base
    pub mounts: Vec<MountSpec>,
}

/// Where containers live and how they are cloned
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// LXC path holding the base container and all clones
    pub lxc_path: String,
    /// Name of the base container all test containers are cloned from
    pub base_name: String,
    /// Where to fetch the base image tarball from when it is not on disk
    pub image_url: Option<String>,
    /// Clone with an overlayfs snapshot instead of a full rootfs copy
    pub snapshot: bool,
    /// Destroy a stale runtime container with the same name before cloning
    pub force_cleanup: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            lxc_path: "/usr/local/autotest/containers".to_string(),
            base_name: "base_09".to_string(),
            image_url: None,
            snapshot: true,
            force_cleanup: false,
        }
    }
}

impl ContainerConfig {
    /// The LXC path with `~` expanded
    pub fn lxc_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.lxc_path).into_owned())
    }
}

/// How runtime commands are issued
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix every lxc-* invocation with `sudo -n`
    pub use_sudo: bool,
    /// Per-command timeout; `None` waits forever
    pub command_timeout_secs: Option<u64>,
    /// Grace period handed to `lxc-stop -t`
    pub stop_timeout_secs: u64,
    /// Upper bound on a base image download, also bounds the wait on the cache lock
    pub download_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            use_sudo: false,
            command_timeout_secs: Some(300),
            stop_timeout_secs: 10,
            download_timeout_secs: 1800,
        }
    }
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl GlobalConfig {
    /// Load global configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load global configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: lxc_path={}, base={}",
            path,
            config.container.lxc_path,
            config.container.base_name
        );

        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "autolxc").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Reject values the runtime layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.container.lxc_path.trim().is_empty() {
            return Err(ConfigError::Invalid("container.lxc_path is empty".into()));
        }
        if self.container.base_name.trim().is_empty() {
            return Err(ConfigError::Invalid("container.base_name is empty".into()));
        }
        for mount in &self.mounts {
            mount.validate()?;
        }
        Ok(())
    }
}
