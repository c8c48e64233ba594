//! Container bucket - owns every test container under one LXC path

use crate::{
    BaseImageCache, BaseImageSpec, CloneIndexLedger, Container, ContainerFactory,
    ContainerIdentity, ContainerState, CoreError, LifecycleEvent, ObserverRegistry, Result,
    RuntimeContext,
};
use autolxc_config::{GlobalConfig, MountSpec};
use autolxc_runtime::{create_fetcher, create_runner, CommandRunner, Fetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Shared, lockable container
pub type ContainerHandle = Arc<Mutex<Container>>;

/// Collaborators a bucket is built from
#[derive(Clone)]
pub struct BucketDeps {
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn Fetcher>,
    pub base_cache: Arc<BaseImageCache>,
    pub observers: Arc<ObserverRegistry>,
}

impl BucketDeps {
    /// Real runner and fetcher as described by the config, with a fresh cache
    /// and no observers
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            runner: create_runner(config),
            fetcher: create_fetcher(
                config.container.image_url.as_deref(),
                config.runtime.download_timeout(),
            ),
            base_cache: Arc::new(BaseImageCache::new()),
            observers: Arc::new(ObserverRegistry::new()),
        }
    }
}

/// Row of [`ContainerBucket::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub identity: ContainerIdentity,
    pub lxc_name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

/// A container that could not be torn down
#[derive(Debug)]
pub struct DestroyFailure {
    pub identity: ContainerIdentity,
    pub error: CoreError,
}

/// Outcome of [`ContainerBucket::destroy_all`]
#[derive(Debug, Default)]
pub struct DestroyReport {
    pub destroyed: Vec<ContainerIdentity>,
    pub failures: Vec<DestroyFailure>,
}

#[derive(Debug, Serialize)]
pub struct DestroySummary {
    pub destroyed: Vec<String>,
    pub failures: Vec<FailureSummary>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub container: String,
    pub error: String,
}

impl DestroyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Serializable form with errors rendered as strings
    pub fn summary(&self) -> DestroySummary {
        DestroySummary {
            destroyed: self.destroyed.iter().map(|id| id.lxc_name()).collect(),
            failures: self
                .failures
                .iter()
                .map(|f| FailureSummary {
                    container: f.identity.lxc_name(),
                    error: f.error.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct BucketInner {
    containers: HashMap<ContainerIdentity, ContainerHandle>,
    /// Lowest index a new generation of each name may use
    next_index: HashMap<String, u32>,
    closed: bool,
}

impl BucketInner {
    fn track(&mut self, identity: &ContainerIdentity, handle: ContainerHandle) {
        let next = self
            .next_index
            .entry(identity.name().to_string())
            .or_insert(0);
        *next = (*next).max(identity.clone_index().saturating_add(1));
        self.containers.insert(identity.clone(), handle);
    }

    fn active_with_name(&self, name: &str) -> Option<&ContainerIdentity> {
        self.containers
            .iter()
            .filter(|(id, handle)| id.name() == name && !is_destroyed(handle))
            .map(|(id, _)| id)
            .max_by_key(|id| id.clone_index())
    }

    /// Forget containers destroyed directly through their handle
    fn prune_destroyed(&mut self) {
        self.containers.retain(|_, handle| !is_destroyed(handle));
    }
}

/// A container whose lock is held is in use, so it does not count as destroyed
fn is_destroyed(handle: &ContainerHandle) -> bool {
    handle
        .try_lock()
        .map(|container| container.state() == ContainerState::Destroyed)
        .unwrap_or(false)
}

/// Owns the base container and every container cloned from it
pub struct ContainerBucket {
    factory: ContainerFactory,
    base: BaseImageSpec,
    base_cache: Arc<BaseImageCache>,
    fetcher: Arc<dyn Fetcher>,
    ledger: CloneIndexLedger,
    snapshot: bool,
    force_cleanup: bool,
    default_mounts: Vec<MountSpec>,
    inner: RwLock<BucketInner>,
}

impl ContainerBucket {
    /// Create an empty bucket without asking the runtime what already exists
    pub fn new(config: &GlobalConfig, deps: BucketDeps) -> Result<Self> {
        config.validate()?;
        let lxc_path = config.container.lxc_path();
        let ctx = RuntimeContext::new(&lxc_path, deps.runner)
            .with_observers(deps.observers)
            .with_timeouts(config.runtime.command_timeout(), config.runtime.stop_timeout());

        Ok(Self {
            factory: ContainerFactory::new(ctx),
            base: BaseImageSpec::from_config(config),
            base_cache: deps.base_cache,
            fetcher: deps.fetcher,
            ledger: CloneIndexLedger::in_lxc_path(&lxc_path),
            snapshot: config.container.snapshot,
            force_cleanup: config.container.force_cleanup,
            default_mounts: config.mounts.clone(),
            inner: RwLock::new(BucketInner::default()),
        })
    }

    /// Create a bucket and adopt every container already under the LXC path,
    /// except the base container
    pub async fn open(config: &GlobalConfig, deps: BucketDeps) -> Result<Self> {
        let bucket = Self::new(config, deps)?;
        let entries = bucket.factory.runtime_listing().await?;
        {
            let mut inner = bucket.inner.write().await;
            for entry in entries {
                // Containers not named by us may share the LXC path
                let identity = match ContainerIdentity::from_lxc_name(&entry.lxc_name) {
                    Ok(identity) => identity,
                    Err(e) => {
                        tracing::warn!("Ignoring container {}: {}", entry.lxc_name, e);
                        continue;
                    }
                };
                if bucket.is_base(&identity) {
                    continue;
                }
                tracing::debug!("Adopting container {} ({})", identity, entry.state);
                let container = bucket.factory.adopt(identity.clone(), entry.state);
                inner.track(&identity, Arc::new(Mutex::new(container)));
            }
        }
        Ok(bucket)
    }

    fn is_base(&self, identity: &ContainerIdentity) -> bool {
        identity.clone_index() == 0 && identity.name() == self.base.name
    }

    pub fn base_spec(&self) -> &BaseImageSpec {
        &self.base
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.factory.context().observers
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    /// The base container, fetched from remote storage once if it is missing
    /// locally and `download_if_missing` is set
    pub async fn get_base_container(&self, download_if_missing: bool) -> Result<ContainerHandle> {
        self.base_cache
            .get_or_prepare(
                &self.base,
                self.factory.context(),
                self.fetcher.as_ref(),
                download_if_missing,
            )
            .await
    }

    /// Clone the base container into a new container called `name`
    pub async fn create_from_base(&self, name: &str) -> Result<ContainerHandle> {
        // Validates the name before anything touches the runtime.
        ContainerIdentity::new(name, 0)?;
        if name == self.base.name {
            return Err(CoreError::NameCollision(format!(
                "{} is the base container",
                name
            )));
        }
        self.check_open_and_free(&*self.inner.read().await, name)?;

        self.get_base_container(true).await?;

        let mut inner = self.inner.write().await;
        inner.prune_destroyed();
        self.check_open_and_free(&inner, name)?;

        let floor = inner.next_index.get(name).copied().unwrap_or(0);
        let index = self.ledger.allocate(name, floor).await?;
        inner.next_index.insert(name.to_string(), index.saturating_add(1));
        let identity = ContainerIdentity::new(name, index)?;

        let container = self.clone_base(&identity).await?;
        let handle = Arc::new(Mutex::new(container));
        inner.track(&identity, Arc::clone(&handle));
        Ok(handle)
    }

    fn check_open_and_free(&self, inner: &BucketInner, name: &str) -> Result<()> {
        if inner.closed {
            return Err(CoreError::BucketClosed);
        }
        if let Some(existing) = inner.active_with_name(name) {
            return Err(CoreError::NameCollision(existing.lxc_name()));
        }
        Ok(())
    }

    async fn clone_base(&self, identity: &ContainerIdentity) -> Result<Container> {
        let ctx = self.factory.context();
        let lxc_name = identity.lxc_name();

        if self.force_cleanup {
            match ctx
                .runner
                .run(&ctx.lxc.destroy(&lxc_name), None, ctx.command_timeout)
                .await
            {
                Ok(out) if out.success() => {
                    tracing::info!("Removed stale container {}", lxc_name)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Cleanup of {} failed: {}", lxc_name, e),
            }
        }

        let mut cloned = false;
        if self.snapshot {
            let output = self.copy_base(&lxc_name, true).await?;
            if output.success() {
                cloned = true;
            } else {
                tracing::warn!(
                    "Snapshot clone of {} failed, falling back to a full copy: {}",
                    lxc_name,
                    output.stderr.trim()
                );
            }
        }
        if !cloned {
            let output = self.copy_base(&lxc_name, false).await?;
            if !output.success() {
                return Err(CoreError::CommandFailed {
                    command: format!("lxc-copy {} -> {}", self.base.name, lxc_name),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }

        let mut container = self.factory.wrap(identity.clone(), ContainerState::Created);
        ctx.observers
            .notify(&LifecycleEvent::Created(identity.clone()));

        for mount in &self.default_mounts {
            if let Err(e) = container
                .add_mount(mount.source_path(), &mount.target, mount.read_only)
                .await
            {
                tracing::warn!("Default mount failed for {}, destroying it", identity);
                if let Err(destroy_err) = container.destroy().await {
                    tracing::warn!("Failed to destroy {}: {}", identity, destroy_err);
                }
                return Err(e);
            }
        }
        Ok(container)
    }

    async fn copy_base(
        &self,
        lxc_name: &str,
        snapshot: bool,
    ) -> Result<autolxc_runtime::CommandOutput> {
        let ctx = self.factory.context();
        let argv = ctx
            .lxc
            .copy(&self.base.lxc_path, &self.base.name, lxc_name, snapshot);
        tracing::debug!("Cloning {} to {} (snapshot: {})", self.base.name, lxc_name, snapshot);
        Ok(ctx.runner.run(&argv, None, ctx.command_timeout).await?)
    }

    pub async fn get(&self, identity: &ContainerIdentity) -> Result<ContainerHandle> {
        let inner = self.inner.read().await;
        inner
            .containers
            .get(identity)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(identity.lxc_name()))
    }

    /// The active generation of `name`
    pub async fn get_by_name(&self, name: &str) -> Result<ContainerHandle> {
        let inner = self.inner.read().await;
        inner
            .active_with_name(name)
            .and_then(|id| inner.containers.get(id))
            .cloned()
            .ok_or_else(|| CoreError::NotFound(name.to_string()))
    }

    /// Snapshot of every owned container, sorted by identity
    pub async fn list(&self) -> Vec<ContainerSummary> {
        let inner = self.inner.read().await;
        let mut summaries = Vec::with_capacity(inner.containers.len());
        for handle in inner.containers.values() {
            let container = handle.lock().await;
            summaries.push(ContainerSummary {
                identity: container.identity().clone(),
                lxc_name: container.lxc_name(),
                state: container.state(),
                created_at: container.created_at(),
            });
        }
        summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
        summaries
    }

    /// Destroy one container and stop tracking it
    pub async fn destroy(&self, identity: &ContainerIdentity) -> Result<()> {
        let mut inner = self.inner.write().await;
        let handle = inner
            .containers
            .get(identity)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(identity.lxc_name()))?;
        handle.lock().await.destroy().await?;
        inner.containers.remove(identity);
        Ok(())
    }

    /// Tear down every owned container concurrently and close the bucket.
    ///
    /// Failures are collected rather than returned early; containers that
    /// could not be destroyed stay in the bucket.
    pub async fn destroy_all(&self) -> DestroyReport {
        let mut inner = self.inner.write().await;
        inner.closed = true;

        let handles: Vec<(ContainerIdentity, ContainerHandle)> = inner
            .containers
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();

        let results = futures::future::join_all(handles.into_iter().map(
            |(identity, handle)| async move {
                let result = handle.lock().await.destroy().await;
                (identity, result)
            },
        ))
        .await;

        let mut report = DestroyReport::default();
        for (identity, result) in results {
            match result {
                Ok(()) => {
                    inner.containers.remove(&identity);
                    report.destroyed.push(identity);
                }
                Err(error) => {
                    tracing::warn!("Failed to destroy {}: {}", identity, error);
                    report.failures.push(DestroyFailure { identity, error });
                }
            }
        }
        report.destroyed.sort();
        report.failures.sort_by(|a, b| a.identity.cmp(&b.identity));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use autolxc_runtime::CommandOutput;
    use std::path::{Path, PathBuf};

    struct Fixture {
        tmp: tempfile::TempDir,
        runner: Arc<MockRunner>,
        fetcher: Arc<MockFetcher>,
        recorder: RecordingObserver,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tmp: tempfile::tempdir().unwrap(),
                runner: Arc::new(MockRunner::new()),
                fetcher: Arc::new(MockFetcher::new(base_image_tarball("base_09"))),
                recorder: RecordingObserver::new(),
            }
        }

        fn path(&self) -> &Path {
            self.tmp.path()
        }

        fn deps(&self) -> BucketDeps {
            let observers = Arc::new(ObserverRegistry::new());
            observers
                .register("rec", Arc::new(self.recorder.clone()))
                .unwrap();
            BucketDeps {
                runner: self.runner.clone(),
                fetcher: self.fetcher.clone(),
                base_cache: Arc::new(BaseImageCache::new()),
                observers,
            }
        }

        fn bucket(&self) -> ContainerBucket {
            ContainerBucket::new(&test_config(self.path()), self.deps()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_from_base() {
        let fx = Fixture::new();
        let bucket = fx.bucket();

        let handle = bucket.create_from_base("t1").await.unwrap();
        let container = handle.lock().await;
        assert_eq!(container.lxc_name(), "t1");
        assert_eq!(container.state(), ContainerState::Created);

        let copy = &fx.runner.calls_to("lxc-copy")[0];
        assert!(copy.contains(&"base_09".to_string()));
        assert!(copy.contains(&"-s".to_string()));
        assert_eq!(fx.fetcher.fetch_count(), 1);
        assert!(fx
            .recorder
            .events()
            .contains(&LifecycleEvent::Created(container.identity().clone())));
    }

    #[tokio::test]
    async fn test_name_collision() {
        let fx = Fixture::new();
        let bucket = fx.bucket();

        bucket.create_from_base("x").await.unwrap();
        let err = bucket.create_from_base("x").await.unwrap_err();
        assert!(matches!(err, CoreError::NameCollision(_)));
        assert_eq!(fx.runner.count("lxc-copy"), 1);
    }

    #[tokio::test]
    async fn test_base_name_is_reserved() {
        let fx = Fixture::new();
        let err = fx.bucket().create_from_base("base_09").await.unwrap_err();
        assert!(matches!(err, CoreError::NameCollision(_)));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_runtime() {
        let fx = Fixture::new();
        let err = fx.bucket().create_from_base("bad name").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidName(_)));
        assert!(fx.runner.calls().is_empty());
        assert_eq!(fx.fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_recreate_after_destroy_uses_next_index() {
        let fx = Fixture::new();
        let bucket = fx.bucket();

        let first = bucket.create_from_base("x").await.unwrap();
        let first_id = first.lock().await.identity().clone();
        assert_eq!(first_id.clone_index(), 0);

        bucket.destroy(&first_id).await.unwrap();
        assert_eq!(first.lock().await.state(), ContainerState::Destroyed);

        let second = bucket.create_from_base("x").await.unwrap();
        let second = second.lock().await;
        assert_eq!(second.identity().clone_index(), 1);
        assert_eq!(second.lxc_name(), "x.1");
    }

    #[tokio::test]
    async fn test_destroying_through_handle_frees_the_name() {
        let fx = Fixture::new();
        let bucket = fx.bucket();

        let first = bucket.create_from_base("x").await.unwrap();
        first.lock().await.destroy().await.unwrap();
        assert!(matches!(
            bucket.get_by_name("x").await,
            Err(CoreError::NotFound(_))
        ));

        let second = bucket.create_from_base("x").await.unwrap();
        assert_eq!(second.lock().await.lxc_name(), "x.1");
        assert!(Arc::ptr_eq(&bucket.get_by_name("x").await.unwrap(), &second));

        let names: Vec<String> = bucket.list().await.into_iter().map(|s| s.lxc_name).collect();
        assert_eq!(names, vec!["x.1"]);
    }

    #[tokio::test]
    async fn test_container_in_use_still_collides() {
        let fx = Fixture::new();
        let bucket = fx.bucket();

        let first = bucket.create_from_base("x").await.unwrap();
        let _guard = first.lock().await;
        assert!(matches!(
            bucket.create_from_base("x").await,
            Err(CoreError::NameCollision(_))
        ));
    }

    #[tokio::test]
    async fn test_indices_survive_a_new_bucket() {
        let fx = Fixture::new();
        let first = fx.bucket();
        let id = first.create_from_base("x").await.unwrap().lock().await.identity().clone();
        first.destroy(&id).await.unwrap();

        let second = fx.bucket();
        let handle = second.create_from_base("x").await.unwrap();
        assert_eq!(handle.lock().await.identity().clone_index(), 1);
    }

    #[tokio::test]
    async fn test_get_and_get_by_name() {
        let fx = Fixture::new();
        let bucket = fx.bucket();
        let created = bucket.create_from_base("t1").await.unwrap();
        let id = created.lock().await.identity().clone();

        assert!(Arc::ptr_eq(&bucket.get(&id).await.unwrap(), &created));
        assert!(Arc::ptr_eq(&bucket.get_by_name("t1").await.unwrap(), &created));

        let missing = ContainerIdentity::new("t1", 7).unwrap();
        assert!(matches!(bucket.get(&missing).await, Err(CoreError::NotFound(_))));
        assert!(matches!(bucket.get_by_name("nope").await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mount_then_run() {
        let fx = Fixture::new();
        let bucket = fx.bucket();
        let host_data = fx.path().join("host_data");
        std::fs::create_dir_all(&host_data).unwrap();

        let handle = bucket.create_from_base("t1").await.unwrap();
        let mut container = handle.lock().await;
        container.add_mount(&host_data, "/data", true).await.unwrap();
        container.start().await.unwrap();
        let output = container.attach_run(&["ls", "/data"]).await.unwrap();

        assert_eq!(output.exit_code, 0);
        let config = std::fs::read_to_string(fx.path().join("t1/config")).unwrap();
        assert!(config.contains("data none bind,ro,create=dir 0 0"));
        let attach = &fx.runner.calls_to("lxc-attach")[0];
        assert_eq!(attach[attach.len() - 2..], ["ls".to_string(), "/data".to_string()]);
    }

    #[tokio::test]
    async fn test_destroy_all_collects_failures() {
        let fx = Fixture::new();
        let bucket = fx.bucket();
        let mut handles = Vec::new();
        for name in ["t1", "t2", "t3"] {
            let handle = bucket.create_from_base(name).await.unwrap();
            handle.lock().await.start().await.unwrap();
            handles.push(handle);
        }
        fx.runner.respond_matching(
            "lxc-stop",
            "t2",
            MockResponse::Output(CommandOutput::failed(1, "t2 is busy")),
        );

        let report = bucket.destroy_all().await;

        let destroyed: Vec<String> = report.destroyed.iter().map(|id| id.lxc_name()).collect();
        assert_eq!(destroyed, vec!["t1", "t3"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].identity.lxc_name(), "t2");
        assert!(!report.is_success());

        assert_eq!(handles[0].lock().await.state(), ContainerState::Destroyed);
        assert_eq!(handles[1].lock().await.state(), ContainerState::Running);
        assert_eq!(handles[2].lock().await.state(), ContainerState::Destroyed);

        let remaining: Vec<String> = bucket.list().await.into_iter().map(|s| s.lxc_name).collect();
        assert_eq!(remaining, vec!["t2"]);

        let summary = serde_json::to_value(report.summary()).unwrap();
        assert_eq!(summary["failures"][0]["container"], "t2");
    }

    #[tokio::test]
    async fn test_closed_after_destroy_all() {
        let fx = Fixture::new();
        let bucket = fx.bucket();
        bucket.create_from_base("t1").await.unwrap();

        let report = bucket.destroy_all().await;
        assert!(report.is_success());
        assert!(bucket.is_closed().await);
        assert!(matches!(
            bucket.create_from_base("t2").await,
            Err(CoreError::BucketClosed)
        ));
    }

    #[tokio::test]
    async fn test_open_adopts_existing_containers() {
        let fx = Fixture::new();
        fx.runner.respond(
            "lxc-ls",
            MockResponse::Output(listing(&[
                ("base_09", "STOPPED"),
                ("t1", "RUNNING"),
                ("t2.3", "STOPPED"),
            ])),
        );

        let bucket = ContainerBucket::open(&test_config(fx.path()), fx.deps())
            .await
            .unwrap();

        let names: Vec<String> = bucket.list().await.into_iter().map(|s| s.lxc_name).collect();
        assert_eq!(names, vec!["t1", "t2.3"]);
        assert!(matches!(
            bucket.create_from_base("t2").await,
            Err(CoreError::NameCollision(_))
        ));

        bucket
            .destroy(&ContainerIdentity::new("t2", 3).unwrap())
            .await
            .unwrap();
        let recreated = bucket.create_from_base("t2").await.unwrap();
        assert_eq!(recreated.lock().await.lxc_name(), "t2.4");
    }

    #[tokio::test]
    async fn test_open_dates_containers_by_their_directory() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.path().join("t1")).unwrap();
        let modified = std::fs::metadata(fx.path().join("t1"))
            .unwrap()
            .modified()
            .unwrap();
        fx.runner.respond(
            "lxc-ls",
            MockResponse::Output(listing(&[("t1", "STOPPED")])),
        );

        let bucket = ContainerBucket::open(&test_config(fx.path()), fx.deps())
            .await
            .unwrap();
        let summaries = bucket.list().await;
        assert_eq!(summaries[0].created_at, DateTime::<Utc>::from(modified));
    }

    #[tokio::test]
    async fn test_open_ignores_foreign_names() {
        let fx = Fixture::new();
        fx.runner.respond(
            "lxc-ls",
            MockResponse::Output(listing(&[("some.vm", "RUNNING"), ("t1", "STOPPED")])),
        );
        let bucket = ContainerBucket::open(&test_config(fx.path()), fx.deps())
            .await
            .unwrap();
        let names: Vec<String> = bucket.list().await.into_iter().map(|s| s.lxc_name).collect();
        assert_eq!(names, vec!["t1"]);
    }

    #[tokio::test]
    async fn test_open_with_malformed_listing() {
        let fx = Fixture::new();
        fx.runner.respond(
            "lxc-ls",
            MockResponse::Output(CommandOutput::ok("NAME STATE\nt1 RUNNING ??\n")),
        );
        let result = ContainerBucket::open(&test_config(fx.path()), fx.deps()).await;
        assert!(matches!(result, Err(CoreError::Parse(_))));
    }

    #[tokio::test]
    async fn test_snapshot_falls_back_to_full_copy() {
        let fx = Fixture::new();
        fx.runner.respond_matching(
            "lxc-copy",
            "-s",
            MockResponse::Output(CommandOutput::failed(1, "overlayfs unsupported")),
        );

        fx.bucket().create_from_base("t1").await.unwrap();

        let copies = fx.runner.calls_to("lxc-copy");
        assert_eq!(copies.len(), 2);
        assert!(copies[0].contains(&"-s".to_string()));
        assert!(!copies[1].contains(&"-s".to_string()));
    }

    #[tokio::test]
    async fn test_failed_clone_is_not_tracked() {
        let fx = Fixture::new();
        fx.runner.respond(
            "lxc-copy",
            MockResponse::Output(CommandOutput::failed(1, "no space left")),
        );
        let bucket = fx.bucket();

        assert!(matches!(
            bucket.create_from_base("t1").await,
            Err(CoreError::CommandFailed { .. })
        ));
        assert!(bucket.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_cleanup_destroys_stale_container() {
        let fx = Fixture::new();
        let mut config = test_config(fx.path());
        config.container.force_cleanup = true;
        let bucket = ContainerBucket::new(&config, fx.deps()).unwrap();

        bucket.create_from_base("t1").await.unwrap();

        let programs: Vec<String> = fx.runner.calls().iter().map(|c| c[0].clone()).collect();
        assert_eq!(programs, vec!["lxc-destroy", "lxc-copy"]);
    }

    #[tokio::test]
    async fn test_default_mount_failure_destroys_clone() {
        let fx = Fixture::new();
        let mut config = test_config(fx.path());
        config.mounts.push(MountSpec {
            source: fx.path().join("missing").to_string_lossy().to_string(),
            target: "/data".to_string(),
            read_only: false,
        });
        let bucket = ContainerBucket::new(&config, fx.deps()).unwrap();

        let err = bucket.create_from_base("t1").await.unwrap_err();
        assert!(matches!(err, CoreError::Mount(_)));
        assert_eq!(fx.runner.count("lxc-destroy"), 1);
        assert!(bucket.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_default_mount_source_expands_tilde() {
        let fx = Fixture::new();
        let home = PathBuf::from(std::env::var("HOME").unwrap());
        let mut config = test_config(fx.path());
        config.mounts.push(MountSpec {
            source: "~".to_string(),
            target: "/home_data".to_string(),
            read_only: true,
        });
        let bucket = ContainerBucket::new(&config, fx.deps()).unwrap();

        let handle = bucket.create_from_base("t1").await.unwrap();
        let container = handle.lock().await;
        assert_eq!(container.mounts()[0].source, home);
    }

    #[tokio::test]
    async fn test_download_failure_surfaces() {
        let fx = Fixture::new();
        let deps = BucketDeps {
            fetcher: Arc::new(MockFetcher::failing()),
            ..fx.deps()
        };
        let bucket = ContainerBucket::new(&test_config(fx.path()), deps).unwrap();

        assert!(matches!(
            bucket.create_from_base("t1").await,
            Err(CoreError::Download(_))
        ));
        assert!(fx.runner.calls_to("lxc-copy").is_empty());
    }

    #[tokio::test]
    async fn test_buckets_share_base_cache() {
        let fx = Fixture::new();
        let deps = fx.deps();
        let a = ContainerBucket::new(&test_config(fx.path()), deps.clone()).unwrap();
        let b = ContainerBucket::new(&test_config(fx.path()), deps).unwrap();

        let (x, y) = tokio::join!(a.get_base_container(true), b.get_base_container(true));
        assert!(Arc::ptr_eq(&x.unwrap(), &y.unwrap()));
        assert_eq!(fx.fetcher.fetch_count(), 1);
    }
}
