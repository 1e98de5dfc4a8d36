//! procpool demo binary.
//!
//! `procpool <config.json>` spawns the configured number of workers (this
//! same executable in worker mode) and serves the HTTP front end.
//! `procpool worker` runs the counting demo worker on stdin/stdout.

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use procpool::{
    CommandSpawner, DemoConfig, Master, Worker, demo, spawn_workers, transport,
};

const WORKER_ARG: &str = "worker";

/// Logs go to stderr: a worker's stdout carries its channel.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PROCPOOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("procpool={}", level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let arg = std::env::args().nth(1);
    match arg.as_deref() {
        Some(WORKER_ARG) => run_worker().await,
        Some(path) => run_master(path).await,
        None => anyhow::bail!("Usage: procpool <CONFIG_FILE>"),
    }
}

async fn run_worker() -> anyhow::Result<()> {
    let mut worker = Worker::stdio();
    demo::install_counters(&mut worker);
    worker.run().await.context("worker channel failed")
}

async fn run_master(config_path: &str) -> anyhow::Result<()> {
    tracing::info!("Initializing ...");
    let config = DemoConfig::load(config_path)?;

    let spawner = CommandSpawner::current_exe(WORKER_ARG)?;
    let connections = spawn_workers(&spawner, config.processes)?;

    let master = Master::new(config.master_config());
    // Before registering, so nothing a worker says at startup is missed.
    demo::log_worker_events(&master);

    let ids = master
        .register_all(connections, config.worker_ids())
        .await
        .context("failed to register workers")?;
    tracing::info!(workers = ?ids, "Workers registered");

    tracing::info!("Initialized!");
    transport::serve(config.server_config(), master).await
}
