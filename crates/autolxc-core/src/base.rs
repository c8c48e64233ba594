//! The base container every test container is cloned from
//!
//! The base image is fetched at most once per cache, even with concurrent
//! callers, and at most once per host thanks to a lock file next to the
//! base container directory.

use crate::archive;
use crate::lock::acquire_lock_async;
use crate::{
    Container, ContainerHandle, ContainerIdentity, ContainerState, CoreError, LifecycleEvent,
    Result, RuntimeContext,
};
use autolxc_config::GlobalConfig;
use autolxc_runtime::Fetcher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

/// Placeholder in a packaged base config that is replaced with the LXC path
const CONTAINER_DIR_PLACEHOLDER: &str = "container_dir";

/// Where the base container lives and where it comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImageSpec {
    pub lxc_path: PathBuf,
    pub name: String,
    pub image_url: Option<String>,
    pub download_timeout: Duration,
}

impl BaseImageSpec {
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            lxc_path: config.container.lxc_path(),
            name: config.container.base_name.clone(),
            image_url: config.container.image_url.clone(),
            download_timeout: config.runtime.download_timeout(),
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        self.lxc_path.join(&self.name)
    }

    /// The base counts as present once its config file exists
    pub fn is_present(&self) -> bool {
        self.base_dir().join("config").is_file()
    }

    fn download_path(&self) -> PathBuf {
        self.lxc_path.join(format!(".{}.download.tar", self.name))
    }
}

/// Cache key: one base container per name per LXC path
type BaseKey = (PathBuf, String);

/// Single-flight holder for base containers, one slot per base
#[derive(Default)]
pub struct BaseImageCache {
    cells: std::sync::Mutex<HashMap<BaseKey, Arc<OnceCell<ContainerHandle>>>>,
}

impl BaseImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, spec: &BaseImageSpec) -> Arc<OnceCell<ContainerHandle>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            cells
                .entry((spec.lxc_path.clone(), spec.name.clone()))
                .or_default(),
        )
    }

    /// The base container described by `spec`, if it has already been resolved
    pub fn get(&self, spec: &BaseImageSpec) -> Option<ContainerHandle> {
        self.cell(spec).get().cloned()
    }

    /// Return the base container, fetching it first if needed and allowed.
    ///
    /// Concurrent callers share one fetch. A failed attempt leaves the cache
    /// empty so a later call can retry.
    pub async fn get_or_prepare(
        &self,
        spec: &BaseImageSpec,
        ctx: &RuntimeContext,
        fetcher: &dyn Fetcher,
        download_if_missing: bool,
    ) -> Result<ContainerHandle> {
        let cell = self.cell(spec);
        let handle = cell
            .get_or_try_init(|| async {
                let downloaded = ensure_present(spec, fetcher, download_if_missing).await?;
                ctx.observers.notify(&LifecycleEvent::BaseReady {
                    name: spec.name.clone(),
                    downloaded,
                });
                let identity = ContainerIdentity::new(spec.name.clone(), 0)?;
                let container = Container::new(identity, ContainerState::Created, ctx.clone());
                Ok::<_, CoreError>(Arc::new(Mutex::new(container)))
            })
            .await?;
        Ok(Arc::clone(handle))
    }
}

/// Make sure the base container exists on disk. Returns whether it was fetched.
async fn ensure_present(
    spec: &BaseImageSpec,
    fetcher: &dyn Fetcher,
    download_if_missing: bool,
) -> Result<bool> {
    if spec.is_present() {
        return Ok(false);
    }
    if !download_if_missing {
        return Err(CoreError::NotFound(format!(
            "base container {} under {}",
            spec.name,
            spec.lxc_path.display()
        )));
    }
    let url = spec.image_url.as_deref().ok_or_else(|| {
        CoreError::Download(format!("no image_url configured for {}", spec.name))
    })?;

    tokio::fs::create_dir_all(&spec.lxc_path).await?;
    let _guard = acquire_lock_async(spec.base_dir(), spec.download_timeout)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => CoreError::Timeout(e.to_string()),
            _ => CoreError::Io(e),
        })?;

    // Another process may have finished while we waited for the lock.
    if spec.is_present() {
        return Ok(false);
    }

    tracing::info!("Fetching base container {} from {}", spec.name, url);
    let archive_path = spec.download_path();
    let result = fetch_and_unpack(spec, fetcher, url, &archive_path).await;
    let _ = tokio::fs::remove_file(&archive_path).await;

    if let Err(e) = result {
        tracing::warn!("Base container setup failed: {}", e);
        return Err(match e {
            CoreError::Download(_) | CoreError::Timeout(_) => e,
            other => CoreError::Download(other.to_string()),
        });
    }
    Ok(true)
}

/// Fetch the archive and unpack it into a staging directory under the LXC
/// path. Only the base directory is moved into place; anything else in the
/// archive is dropped with the staging directory.
async fn fetch_and_unpack(
    spec: &BaseImageSpec,
    fetcher: &dyn Fetcher,
    url: &str,
    archive_path: &Path,
) -> Result<()> {
    fetcher.fetch(url, archive_path).await?;

    let staging = tempfile::Builder::new()
        .prefix(&format!(".{}.unpack", spec.name))
        .tempdir_in(&spec.lxc_path)?;
    let archive_path = archive_path.to_path_buf();
    let dest = staging.path().to_path_buf();
    tokio::task::spawn_blocking(move || archive::unpack_file(&archive_path, &dest))
        .await
        .map_err(|e| CoreError::Download(e.to_string()))?
        .map_err(|e| CoreError::Download(format!("{}: {}", url, e)))?;

    let staged = staging.path().join(&spec.name);
    let config_path = staged.join("config");
    let config = tokio::fs::read_to_string(&config_path).await.map_err(|_| {
        CoreError::Download(format!(
            "{} does not contain {}/config",
            url, spec.name
        ))
    })?;
    let rewritten =
        config.replace(CONTAINER_DIR_PLACEHOLDER, &spec.lxc_path.to_string_lossy());
    tokio::fs::write(&config_path, rewritten).await?;

    // A directory without a config is debris from an interrupted setup.
    let base_dir = spec.base_dir();
    if tokio::fs::metadata(&base_dir).await.is_ok() {
        tracing::warn!("Replacing incomplete base container at {}", base_dir.display());
        tokio::fs::remove_dir_all(&base_dir).await?;
    }
    tokio::fs::rename(&staged, &base_dir).await?;
    Ok(())
}
