//! sheetrelay: command-line front end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sheetrelay::{
    ClaimManager, DiscoveryEngine, DriverRegistry, JsonFileStore, Orchestrator, RetryingStore, RunConfig,
    ScriptedDriver, SharedStore, TaskGroup,
};

/// Dispatch prompts from a shared table to worker sessions
#[derive(Parser)]
#[command(name = "sheetrelay")]
#[command(about = "Row-claiming task orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Run configuration (TOML)
    #[arg(short, long, env = "SHEETRELAY_CONFIG", default_value = "sheetrelay.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every group in order
    Run {
        /// JSON cell store
        #[arg(short, long, env = "SHEETRELAY_STORE")]
        store: PathBuf,

        /// Answer with a scripted echo driver instead of spawning workers
        #[arg(long)]
        dry_run: bool,

        /// Skip groups numbered below this
        #[arg(long)]
        start_group: Option<u32>,
    },

    /// Show per-group progress
    Status {
        /// JSON cell store
        #[arg(short, long, env = "SHEETRELAY_STORE")]
        store: PathBuf,
    },

    /// Clear expired claim markers
    Unlock {
        /// JSON cell store
        #[arg(short, long, env = "SHEETRELAY_STORE")]
        store: PathBuf,

        /// Only this group
        #[arg(long)]
        group: Option<u32>,
    },

    /// Check the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut config = RunConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            store,
            dry_run,
            start_group,
        } => {
            if start_group.is_some() {
                config.settings.start_group = start_group;
            }
            run(&config, store, dry_run).await
        }
        Commands::Status { store } => status(&config, store).await,
        Commands::Unlock { store, group } => unlock(&config, store, group).await,
        Commands::Validate => validate(&config),
    }
}

/// Initialize logging from `RUST_LOG`, defaulting to `sheetrelay=info`.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheetrelay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open_store(path: &Path) -> Result<JsonFileStore> {
    JsonFileStore::open(path)
        .await
        .with_context(|| format!("failed to open store {}", path.display()))
}

async fn claim_manager(config: &RunConfig, path: &Path) -> Result<ClaimManager> {
    let store: Arc<dyn SharedStore> = Arc::new(RetryingStore::new(
        open_store(path).await?,
        config.retry.store.clone(),
    ));
    Ok(ClaimManager::new(store, config.settings.sentinel.clone())
        .with_timeouts((&config.timeouts).into()))
}

fn groups(config: &RunConfig, only: Option<u32>) -> Result<Vec<TaskGroup>> {
    let groups = config
        .ordered_groups()
        .into_iter()
        .filter(|g| only.map_or(true, |n| g.number == n))
        .map(TaskGroup::from_config)
        .collect::<Result<Vec<_>, _>>()?;
    if let (Some(n), true) = (only, groups.is_empty()) {
        bail!("group {n} is not defined");
    }
    Ok(groups)
}

async fn run(config: &RunConfig, store: PathBuf, dry_run: bool) -> Result<()> {
    let registry = if dry_run {
        let driver = Arc::new(ScriptedDriver::new());
        let mut registry = DriverRegistry::new();
        for group in &config.groups {
            for worker_type in &group.worker_types {
                registry.register(worker_type.clone(), driver.clone());
            }
        }
        registry
    } else {
        let missing = config.missing_worker_types();
        if !missing.is_empty() {
            bail!("no [[worker]] entry for: {}", missing.join(", "));
        }
        DriverRegistry::from_config(config)
    };

    let store = Arc::new(open_store(&store).await?);
    let orchestrator = Orchestrator::from_config(config, store, registry)?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next batch boundary");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn status(config: &RunConfig, store: PathBuf) -> Result<()> {
    let discovery = DiscoveryEngine::new(claim_manager(config, &store).await?);
    for group in groups(config, None)? {
        let progress = discovery.group_progress(&group).await?;
        println!(
            "group {:>3}  terminal {:>4}  claimed {:>4}  claimable {:>4}  blank {:>4}",
            group.number(),
            progress.terminal,
            progress.claimed,
            progress.claimable,
            progress.blank_rows
        );
    }
    Ok(())
}

async fn unlock(config: &RunConfig, store: PathBuf, only: Option<u32>) -> Result<()> {
    let claims = claim_manager(config, &store).await?;
    for group in groups(config, only)? {
        let cleared = claims.unlock_expired(&group).await?;
        for address in &cleared {
            println!("cleared {address}");
        }
    }
    Ok(())
}

fn validate(config: &RunConfig) -> Result<()> {
    config.validate()?;
    let missing = config.missing_worker_types();
    if !missing.is_empty() {
        bail!("no [[worker]] entry for: {}", missing.join(", "));
    }
    println!(
        "configuration ok: {} group(s), {} worker type(s)",
        config.groups.len(),
        config.workers.len()
    );
    Ok(())
}
