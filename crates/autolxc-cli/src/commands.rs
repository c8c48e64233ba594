//! CLI command implementations

use anyhow::{bail, Context, Result};
use autolxc_config::{GlobalConfig, MountSpec};
use autolxc_core::{
    BucketDeps, ContainerBucket, ContainerHandle, ContainerState, LoggingObserver,
};
use std::path::Path;
use std::sync::Arc;

/// Open the bucket for the configured LXC path with the real runtime
pub async fn open_bucket(config: &GlobalConfig) -> Result<ContainerBucket> {
    let deps = BucketDeps::from_config(config);
    deps.observers.register("log", Arc::new(LoggingObserver))?;
    ContainerBucket::open(config, deps)
        .await
        .with_context(|| format!("Failed to open {}", config.container.lxc_path))
}

/// Parse `--mount` values before anything touches the runtime
pub fn parse_mounts(specs: &[String]) -> Result<Vec<MountSpec>> {
    specs
        .iter()
        .map(|s| {
            s.parse::<MountSpec>()
                .with_context(|| format!("Invalid --mount value '{}'", s))
        })
        .collect()
}

/// Make sure the base container is on disk, downloading it if needed
pub async fn setup_base(bucket: &ContainerBucket) -> Result<()> {
    let spec = bucket.base_spec();
    if !spec.is_present() {
        println!("Fetching base container '{}'...", spec.name);
    }
    bucket.get_base_container(true).await?;
    println!("Base container ready at {}", spec.base_dir().display());
    Ok(())
}

/// Clone a new container from the base
pub async fn create(
    bucket: &ContainerBucket,
    name: &str,
    mounts: &[MountSpec],
    start: bool,
) -> Result<()> {
    let handle = bucket.create_from_base(name).await?;
    let mut container = handle.lock().await;

    for mount in mounts {
        if let Err(e) = container
            .add_mount(mount.source_path(), &mount.target, mount.read_only)
            .await
        {
            let identity = container.identity().clone();
            drop(container);
            if let Err(destroy_err) = bucket.destroy(&identity).await {
                tracing::warn!("Failed to destroy {}: {}", identity, destroy_err);
            }
            return Err(e).context(format!("Failed to mount {}", mount.source));
        }
    }

    if start {
        container.start().await?;
    }

    println!("Created container '{}' ({})", container.lxc_name(), container.state());
    Ok(())
}

async fn find(bucket: &ContainerBucket, name: &str) -> Result<ContainerHandle> {
    bucket
        .get_by_name(name)
        .await
        .with_context(|| format!("Container '{}' not found", name))
}

/// Start a container
pub async fn start(bucket: &ContainerBucket, name: &str) -> Result<()> {
    let handle = find(bucket, name).await?;
    let mut container = handle.lock().await;
    if container.state() == ContainerState::Running {
        println!("Container '{}' is already running", container.lxc_name());
        return Ok(());
    }
    container.start().await?;
    println!("Started container '{}'", container.lxc_name());
    Ok(())
}

/// Stop a container
pub async fn stop(bucket: &ContainerBucket, name: &str) -> Result<()> {
    let handle = find(bucket, name).await?;
    let mut container = handle.lock().await;
    if container.state() != ContainerState::Running {
        println!("Container '{}' is not running", container.lxc_name());
        return Ok(());
    }
    container.stop().await?;
    println!("Stopped container '{}'", container.lxc_name());
    Ok(())
}

/// Destroy a container
pub async fn destroy(bucket: &ContainerBucket, name: &str) -> Result<()> {
    let handle = find(bucket, name).await?;
    let identity = handle.lock().await.identity().clone();
    bucket.destroy(&identity).await?;
    println!("Destroyed container '{}'", identity);
    Ok(())
}

/// Run a command in a running container and return its exit code
pub async fn run(bucket: &ContainerBucket, name: &str, cmd: Vec<String>) -> Result<i32> {
    // A single argument is treated as a shell-quoted command line
    let cmd = if cmd.len() == 1 {
        shell_words::split(&cmd[0])
            .with_context(|| format!("Failed to parse command: {}", cmd[0]))?
    } else {
        cmd
    };
    if cmd.is_empty() {
        bail!("No command specified");
    }

    let handle = find(bucket, name).await?;
    let container = handle.lock().await;
    if container.state() != ContainerState::Running {
        bail!(
            "Container '{}' is not running (state: {})",
            container.lxc_name(),
            container.state()
        );
    }

    let output = container.attach_run(cmd.as_slice()).await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    Ok(output.exit_code)
}

/// List containers
pub async fn list(bucket: &ContainerBucket, json: bool) -> Result<()> {
    let containers = bucket.list().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&containers)?);
        return Ok(());
    }

    if containers.is_empty() {
        println!("No containers found.");
        println!("\nUse 'autolxc create <name>' to clone one from the base container.");
        return Ok(());
    }

    const NAME_WIDTH: usize = 26;
    const STATE_WIDTH: usize = 12;

    println!("  {:<NAME_WIDTH$} {:<STATE_WIDTH$} CREATED", "NAME", "STATE");
    println!("{}", "-".repeat(60));

    for container in containers {
        let symbol = match container.state {
            ContainerState::Running => "●",
            ContainerState::Stopped => "○",
            ContainerState::Created => "◔",
            ContainerState::Destroyed => "✗",
        };
        println!(
            "{} {:<NAME_WIDTH$} {:<STATE_WIDTH$} {}",
            symbol,
            container.lxc_name,
            container.state.to_string(),
            container.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Destroy every container in the bucket
pub async fn cleanup(bucket: &ContainerBucket, skip_confirm: bool) -> Result<()> {
    let containers = bucket.list().await;
    if containers.is_empty() {
        println!("No containers to clean up.");
        return Ok(());
    }

    if !skip_confirm {
        if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
            bail!("Refusing to destroy containers without confirmation; pass --yes");
        }
        let confirmed = dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt(format!("Destroy {} container(s)?", containers.len()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let report = bucket.destroy_all().await;
    for identity in &report.destroyed {
        println!("Destroyed {}", identity);
    }
    for failure in &report.failures {
        eprintln!("Failed to destroy {}: {}", failure.identity, failure.error);
    }
    if !report.is_success() {
        bail!(
            "{} of {} container(s) could not be destroyed",
            report.failures.len(),
            report.failures.len() + report.destroyed.len()
        );
    }
    Ok(())
}

/// Show or edit the configuration file
pub async fn config(config_path: &Path, edit: bool) -> Result<()> {
    if edit {
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

        if !config_path.exists() {
            GlobalConfig::default().save_to(config_path)?;
            println!("Created default config at {:?}", config_path);
        }

        std::process::Command::new(&editor)
            .arg(config_path)
            .status()
            .context(format!("Failed to open editor: {}", editor))?;
    } else if config_path.exists() {
        let content = std::fs::read_to_string(config_path)?;
        println!("# Config file: {:?}\n", config_path);
        println!("{}", content);
    } else {
        println!("# Config file: {:?} (not created yet)\n", config_path);
        println!("# Default configuration:");
        let content = toml::to_string_pretty(&GlobalConfig::default())?;
        println!("{}", content);
        println!("\n# Run 'autolxc config --edit' to create and edit the config file.");
    }

    Ok(())
}
