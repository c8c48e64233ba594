//! autolxc - LXC test container manager CLI

use anyhow::Context;
use autolxc_cli::commands;
use autolxc_config::GlobalConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "autolxc")]
#[command(author, version, about = "LXC test container manager", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and unpack the base container if it is missing
    SetupBase,

    /// Clone a new container from the base
    Create {
        /// Container name
        name: String,
        /// Bind mount, as source:target or source:target:ro (repeatable)
        #[arg(short, long = "mount")]
        mounts: Vec<String>,
        /// Start the container after creating it
        #[arg(long)]
        start: bool,
    },

    /// Start a container
    Start {
        /// Container name
        name: String,
    },

    /// Stop a container
    Stop {
        /// Container name
        name: String,
    },

    /// Destroy a container
    Destroy {
        /// Container name
        name: String,
    },

    /// Run a command in a running container
    Run {
        /// Container name
        name: String,
        /// Command to run
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// List containers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Destroy every container except the base
    Cleanup {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show or edit configuration
    Config {
        /// Open config in editor
        #[arg(short, long)]
        edit: bool,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => GlobalConfig::config_path()?,
    };

    // Config command doesn't need a valid config or a runtime
    if let Commands::Config { edit } = cli.command {
        commands::config(&config_path, edit).await?;
        return Ok(0);
    }

    let config = GlobalConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // Reject bad mounts before touching the runtime
    let mounts = match &cli.command {
        Commands::Create { mounts, .. } => commands::parse_mounts(mounts)?,
        _ => Vec::new(),
    };

    let bucket = commands::open_bucket(&config).await?;

    match cli.command {
        Commands::SetupBase => commands::setup_base(&bucket).await?,
        Commands::Create { name, start, .. } => {
            commands::create(&bucket, &name, &mounts, start).await?
        }
        Commands::Start { name } => commands::start(&bucket, &name).await?,
        Commands::Stop { name } => commands::stop(&bucket, &name).await?,
        Commands::Destroy { name } => commands::destroy(&bucket, &name).await?,
        Commands::Run { name, cmd } => return commands::run(&bucket, &name, cmd).await,
        Commands::List { json } => commands::list(&bucket, json).await?,
        Commands::Cleanup { yes } => commands::cleanup(&bucket, yes).await?,
        Commands::Config { .. } => unreachable!(), // Handled above
    }

    Ok(0)
}
