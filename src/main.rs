//! kube-inventory - Kubernetes inventory sync

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing::{error, info, warn};

use kube_inventory::collector::KubeCollector;
use kube_inventory::config::{StoreConfig, SyncConfig};
use kube_inventory::persister::{ApplyStrategy, Engine};
use kube_inventory::refresh::Refresher;
use kube_inventory::supervisor::Supervisor;
use kube_inventory::telemetry::init_logging;

/// kube-inventory - mirror Kubernetes inventory into a local store
#[derive(Parser, Debug)]
#[command(name = "kube-inventory", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'f', long = "config", env = "KUBE_INVENTORY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Persist to a sled database at this path instead of the configured store
    #[arg(long, env = "KUBE_INVENTORY_STORE_PATH", global = true)]
    store_path: Option<PathBuf>,

    /// Apply strategy: default, batch or concurrent-safe-batch
    #[arg(long, env = "KUBE_INVENTORY_STRATEGY", global = true)]
    strategy: Option<ApplyStrategy>,

    /// Emit logs as JSON
    #[arg(long, env = "KUBE_INVENTORY_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Full refresh, then watch and reconcile until stopped (default mode)
    Run,

    /// Run one full refresh, print the report as JSON and exit
    Refresh,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let result = match cli.command {
        Some(Commands::Refresh) => run_refresh(&cli).await,
        Some(Commands::Run) | None => run(&cli).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Load the file (if any) and apply command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(path) = &cli.store_path {
        config.store = StoreConfig::Sled { path: path.clone() };
    }
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }
    config.validate()?;
    Ok(config)
}

async fn build_refresher(
    config: &SyncConfig,
) -> anyhow::Result<(Refresher, Arc<KubeCollector>)> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let collector = Arc::new(KubeCollector::new(client).with_page_size(config.page_size));

    let store = config.store.open()?;
    let engine = Engine::new(store, Arc::new(config.tag_mapper()), config.strategy);
    let refresher = Refresher::new(
        collector.clone(),
        engine,
        config.watched_kinds()?,
        config.fetch_retry.clone(),
    );
    Ok((refresher, collector))
}

/// One full pass; true when every kind listed and committed
async fn run_refresh(cli: &Cli) -> anyhow::Result<bool> {
    let config = load_config(cli)?;
    let (refresher, _) = build_refresher(&config).await?;

    let refresh = refresher.full_refresh().await?;
    println!("{}", serde_json::to_string_pretty(&refresh)?);
    Ok(refresh.is_success())
}

/// Watch until stopped; true when every task joined in time
async fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = load_config(cli)?;
    let (refresher, collector) = build_refresher(&config).await?;

    info!(
        kinds = ?config.watched_kinds()?,
        strategy = %config.strategy,
        "Starting inventory sync"
    );

    let initial = refresher.full_refresh().await?;
    if !initial.is_success() {
        warn!(
            failed_listings = ?initial.failed_listings,
            failed_kinds = ?initial.report.failed_kinds,
            "Initial full refresh incomplete"
        );
    }

    let supervisor = Supervisor::start(
        collector,
        refresher,
        &initial.versions,
        config.supervisor(),
    );
    if !initial.is_success() {
        supervisor.request_full_refresh();
    }

    shutdown_signal().await;
    info!(status = ?supervisor.connection_status(), "Shutdown requested");

    let report = supervisor.shutdown().await;
    if !report.is_clean() {
        error!(unjoined = ?report.unjoined, "Tasks failed to stop in time");
    }
    Ok(report.is_clean())
}

/// Wait for Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
