//! Simulcast server - Main entry point
//!
//! Runs in one of two modes:
//! - primary (default): supervises one worker process per CPU
//! - worker (`--worker`): serves the HTTP API and SSE fan-out on one port

use anyhow::{Context, Result};
use clap::Parser;
use simulcast_common::events::ControlBus;
use simulcast_server::api::{self, AppContext};
use simulcast_server::config::ServerConfig;
use simulcast_server::fanout::FanoutHub;
use simulcast_server::supervisor::{self, RespawnPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for simulcast-server
#[derive(Parser, Debug)]
#[command(name = "simulcast-server")]
#[command(about = "Simulated-live broadcast server")]
#[command(version)]
struct Args {
    /// Run as a worker process instead of the supervisor
    #[arg(long, hide = true)]
    worker: bool,

    /// Port to listen on (workers only; the supervisor assigns ports)
    #[arg(short, long, env = "SIMULCAST_PORT")]
    port: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(short, long, env = "SIMULCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the worker process count (0 = one per CPU)
    #[arg(short, long, env = "SIMULCAST_WORKERS")]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simulcast_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    if args.worker {
        run_worker(&config, args.port.unwrap_or(config.base_port)).await
    } else if config.effective_workers() <= 1 {
        // Single-worker deployments skip the fork layer entirely
        run_worker(&config, args.port.unwrap_or(config.base_port)).await
    } else {
        info!("Starting simulcast supervisor");
        supervisor::run(&config, args.config.clone(), RespawnPolicy::default())
            .await
            .context("Supervisor error")
    }
}

async fn run_worker(config: &ServerConfig, port: u16) -> Result<()> {
    info!("Starting simulcast worker on port {}", port);

    let db_pool = simulcast_common::db::init_database(&config.db_path)
        .await
        .context("Failed to initialize database")?;

    let (bus, hub) = if config.fanout_enabled() {
        let bus = ControlBus::new(config.bus_capacity);
        let hub = FanoutHub::start(
            &bus,
            Duration::from_secs(config.heartbeat_secs),
            Duration::from_millis(config.close_grace_ms),
        );
        (Some(bus), Some(hub))
    } else {
        if config.events_enabled {
            warn!(
                "Control event push requires a single worker ({} configured); \
                 stream endpoint will return 503 and viewers will poll",
                config.effective_workers()
            );
        } else {
            info!("Control event fan-out disabled; viewers will poll");
        }
        (None, None)
    };

    let ctx = AppContext {
        db_pool,
        bus,
        hub,
        resolver: None,
    };

    api::run(config, port, ctx).await.context("Server error")
}
