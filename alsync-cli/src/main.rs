use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use alsync_remote::{AlistClient, RemoteStorage};
use alsync_store::UpdateCache;
use alsync_sync::{RunReport, SyncCoordinator};

mod config;

use config::{default_config_path, Auth, Config};

#[derive(Parser)]
#[command(name = "alsync")]
#[command(about = "Keep item directories on an Alist server in sync", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ~/.alsync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every item directory and propagate changes (default)
    Run,

    /// Print every entry of the update cache
    Status,

    /// Write an example config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::example().save(&config_path)?;
            println!("Wrote example config to {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run => run(Config::load(&config_path)?).await,
        Commands::Status => status(Config::load(&config_path)?).await,
    }
}

async fn connect(config: &Config) -> Result<Arc<dyn RemoteStorage>> {
    let base_url = &config.remote.base_url;
    let client = match config.auth()? {
        Auth::Token(token) => AlistClient::with_token(base_url, token)?,
        Auth::Credentials { username, password } => {
            let client = AlistClient::new(base_url)?;
            client
                .login(&username, &password)
                .await
                .with_context(|| format!("Failed to log in to {}", base_url))?;
            client
        }
    };
    Ok(Arc::new(client))
}

async fn run(config: Config) -> Result<ExitCode> {
    let remote = connect(&config).await?;
    let coordinator = SyncCoordinator::open(
        remote,
        config.item_dirs()?,
        &config.cache_path,
        config.sync_config(),
    )
    .context("Failed to set up sync coordinator")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after current step");
            let _ = shutdown_tx.send(true);
        }
    });

    match coordinator.run(shutdown_rx).await? {
        RunReport::NothingToSync => {
            info!("Nothing to sync");
            Ok(ExitCode::SUCCESS)
        }
        RunReport::Completed { tasks } => {
            info!("Sync complete, {} file(s) propagated", tasks);
            Ok(ExitCode::SUCCESS)
        }
        RunReport::Incomplete { unfinished } => {
            for (path, status) in &unfinished {
                error!("{} stuck in {}", path, status);
            }
            error!(
                "{} task(s) unfinished, the next run resumes them",
                unfinished.len()
            );
            Ok(ExitCode::from(2))
        }
    }
}

async fn status(config: Config) -> Result<ExitCode> {
    let cache = UpdateCache::open(&config.cache_path, config.item_dirs()?)
        .context("Failed to open update cache")?;

    let locked = cache.is_locked().await;
    println!("locked: {}", locked);
    for (path, entry) in cache.store().full_paths().await? {
        println!("{}\t{}", path, serde_json::to_string(&entry)?);
    }
    Ok(ExitCode::SUCCESS)
}
