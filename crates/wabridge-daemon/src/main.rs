//! wabridge Daemon
//!
//! Maintenance entry point for the multi-identity session manager: runs the
//! startup checks and the reclaimer loop, and exposes one-shot catalog
//! commands for operators of the deployment.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use wabridge_core::config::{Config, load_config, load_config_file};
use wabridge_core::ports::TracingActivityLog;
use wabridge_core::{Keyboard, OperatorId, Transport, TransportError, UiHandle};
use wabridge_daemon::Bridge;
use wabridge_daemon::detached::DetachedFactory;

#[derive(Parser, Debug)]
#[command(name = "wabridge-daemon")]
#[command(version, about = "wabridge daemon - multi-identity WhatsApp session manager")]
struct Args {
    /// Storage root holding the master catalog and per-owner directories
    #[arg(long, global = true, env = "WABRIDGE_ROOT")]
    root: Option<PathBuf>,

    /// Settings file; replaces the global/project lookup when given
    #[arg(long, global = true, env = "WABRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the wabridge crates (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "WABRIDGE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "WABRIDGE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate, validate and sweep, then run the reclaimer until shutdown (default)
    Run,
    /// Print catalogued identities as JSON
    List {
        #[arg(long)]
        owner: Option<OperatorId>,
    },
    /// Delete per-identity store files with no catalog row
    SweepOrphans,
    /// Check every catalogued identity against the disk
    Validate,
    /// Destroy an operator's identities whose phone is not listed
    Prune {
        #[arg(long)]
        owner: OperatorId,
        /// Phones to keep (comma separated or repeated)
        #[arg(long, value_delimiter = ',')]
        keep: Vec<String>,
    },
    /// Import identities from legacy per-bot catalogs next to the master
    Migrate,
}

/// Transport for headless runs: operator messages go to the log.
struct LogTransport;

#[async_trait::async_trait]
impl Transport for LogTransport {
    async fn send(
        &self,
        operator: OperatorId,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<UiHandle, TransportError> {
        info!(operator, text, "Operator message");
        Ok(UiHandle(uuid::Uuid::new_v4().to_string()))
    }

    async fn edit(
        &self,
        operator: OperatorId,
        handle: &UiHandle,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        info!(operator, handle = %handle.0, text, "Operator message edited");
        Ok(())
    }
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    wabridge_core::tracing_init::init_tracing(
        &wabridge_core::tracing_init::wabridge_filter(&args.log_level),
        args.log_json,
    );

    let config = resolve_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %config.storage.root.display(),
        "Starting wabridge-daemon"
    );

    let factory = Arc::new(DetachedFactory::new(config.storage.busy_timeout()));
    let bridge = Bridge::open(
        &config,
        factory,
        Arc::new(LogTransport),
        Arc::new(TracingActivityLog),
    )
    .await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&bridge).await?,
        Command::List { owner } => {
            let identities = match owner {
                Some(owner) => bridge.list_identities(owner).await?,
                None => bridge.registry().list_all().await?,
            };
            println!("{}", serde_json::to_string_pretty(&identities)?);
        }
        Command::SweepOrphans => {
            let report = bridge.reclaimer().sweep_orphan_files().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Validate => {
            let report = bridge.reclaimer().validate_startup().await?;
            wait_for_pending_destroys(&bridge).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Prune { owner, keep } => {
            let report = bridge.prune_identities(owner, keep.as_slice()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Migrate => {
            let copied = bridge.registry().migrate_from_legacy().await?;
            println!("{copied}");
        }
    }

    Ok(())
}

async fn run(bridge: &Bridge) -> anyhow::Result<()> {
    bridge.startup().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reclaimer_handle = bridge.spawn_reclaimer(shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Reclaimer running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = reclaimer_handle.await;
    wait_for_pending_destroys(bridge).await;

    info!("Daemon stopped");
    Ok(())
}

/// Debounced destroys run on their own tasks; let them land before exiting.
async fn wait_for_pending_destroys(bridge: &Bridge) {
    let debounce = bridge.pool().config().logout_debounce();
    for _ in 0..20 {
        if bridge.pool().pending_destroys().is_empty() {
            return;
        }
        tokio::time::sleep(debounce).await;
    }
}

fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => {
            let cwd = std::env::current_dir()?;
            load_config(Some(&cwd))?
        }
    };
    if let Some(root) = &args.root {
        config.storage.root.clone_from(root);
    } else if config.storage.root == PathBuf::from(".") {
        config.storage.root = default_root()?;
    }
    Ok(config)
}

/// Default storage root: ~/.wabridge
fn default_root() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".wabridge"))
}
