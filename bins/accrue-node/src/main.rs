//! Accrue reward node binary.
//!
//! Opens the RocksDB reward store, runs the rollover / auto-claim and
//! reconciliation loops, and serves the JSON-RPC API.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use accrue_engine::RewardEngine;
use accrue_node_lib::{start_rpc_server, NodeConfig, RocksStore, Scheduler};

#[derive(Parser, Debug)]
#[command(
    name = "accrue-node",
    version,
    about = "Reward accrual node with RocksDB storage and JSON-RPC server"
)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the reward store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    /// Seconds between rollover / auto-claim sweeps
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Seconds between reconciliation sweeps (0 disables)
    #[arg(long)]
    reconcile_interval_secs: Option<u64>,
}

impl Args {
    /// Flags win over the file and the environment.
    fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(bind) = self.rpc_bind {
            config.rpc_bind = bind;
        }
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
        if let Some(secs) = self.reconcile_interval_secs {
            config.reconcile_interval_secs = secs;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match NodeConfig::load(args.config.as_deref()) {
        Ok(c) => args.apply(c),
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            process::exit(1);
        }
    };

    init_logging(&config.log_level, &config.log_format);

    info!("Accrue Node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("rpc_addr: {}", config.rpc_addr());
    info!(
        poll_secs = config.poll_interval().as_secs(),
        reconcile_secs = config.reconcile_interval().map_or(0, |d| d.as_secs()),
        "maintenance schedule"
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    let store = match RocksStore::open(config.db_path()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open reward store: {}", e);
            process::exit(1);
        }
    };
    match store.event_count() {
        Ok(n) => info!("reward store opened, {} events", n),
        Err(e) => warn!("could not count events: {}", e),
    }

    let engine = Arc::new(
        RewardEngine::new(store, config.policy.clone()).with_retry(config.retry_policy()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = Scheduler::from_config(engine.clone(), &config).spawn(shutdown_rx);

    let rpc_handle = match start_rpc_server(&config.rpc_addr(), engine).await {
        Ok(handle) => {
            info!("RPC server listening on {}", config.rpc_addr());
            handle
        }
        Err(e) => {
            error!("failed to start RPC server: {}", e);
            process::exit(1);
        }
    };

    info!("Accrue node running (Ctrl+C to stop)");

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("received Ctrl+C, shutting down..."),
            Err(e) => error!("failed to listen for Ctrl+C: {}", e),
        },
        _ = rpc_handle.clone().stopped() => {
            warn!("RPC server exited");
        }
    }

    shutdown_tx.send(true).ok();
    for handle in loops {
        if let Err(e) = handle.await {
            warn!("maintenance loop ended abnormally: {}", e);
        }
    }
    info!("maintenance loops stopped");

    rpc_handle.stop().ok();
    info!("RPC server stopped");
    info!("Accrue node shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
