//! podprofd — the podprof collector daemon.
//!
//! Single binary that assembles the ingestion stack:
//! - Agent connection acceptor (TCP)
//! - Connection pool supervisor (idle eviction, pod collisions)
//! - Stream hub (rotation + sinks)
//! - Pod activity tracker (periodic statistics flush)
//!
//! # Usage
//!
//! ```text
//! podprofd run --port 4715 --config /etc/podprof/collector.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use podprof_collector::tcp::{acceptor, connection::ConnectionDeps};
use podprof_collector::{CollectorMetrics, PodTracker, StreamHub, Supervisor};
use podprof_model::CollectorConfig;
use podprof_persist::{InMemoryPersistence, SharedPersistence};

#[derive(Parser)]
#[command(name = "podprofd", about = "podprof collector daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collector endpoint.
    Run {
        /// Configuration file (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured agent listen port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "info,podprofd=debug,podprof_collector=debug".parse().unwrap()
                }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, port } => run(config, port).await,
    }
}

async fn run(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    info!("podprof collector starting");

    let mut config = match &config_path {
        Some(path) => CollectorConfig::from_file(path)?,
        None => CollectorConfig::default(),
    };
    if let Some(port) = port {
        config.listen_port = port;
    }
    let config = Arc::new(config);
    info!(
        port = config.listen_port,
        max_connections = config.max_connections(),
        max_open_streams = config.max_open_streams(),
        "configuration loaded"
    );

    // ── Persistence ──────────────────────────────────────────────
    // Durable adapters implement podprof_persist::Persistence; without
    // one configured, records are held in process memory.
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    info!("in-memory persistence attached");

    // ── Subsystems ───────────────────────────────────────────────
    let pods = Arc::new(PodTracker::new(&config, persistence.clone()));
    let hub = Arc::new(StreamHub::new(config.clone(), persistence.clone(), pods.clone()));
    let metrics = Arc::new(CollectorMetrics::new());
    let supervisor = Arc::new(Supervisor::new());
    info!("stream hub and pod tracker initialized");

    let deps = Arc::new(ConnectionDeps {
        config: config.clone(),
        hub,
        pods: pods.clone(),
        metrics,
    });

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_handle = {
        let supervisor = supervisor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    };

    let flush_handle = {
        let pods = pods.clone();
        let interval = config.stat_persist_interval();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { pods.run(interval, shutdown).await })
    };

    // ── Acceptor ─────────────────────────────────────────────────
    let listener = acceptor::bind(config.listen_port).await?;
    let acceptor_handle = tokio::spawn(acceptor::run(
        listener,
        deps,
        supervisor.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = acceptor_handle.await;
    let _ = supervisor_handle.await;
    let _ = flush_handle.await;

    info!("collector stopped");
    Ok(())
}
