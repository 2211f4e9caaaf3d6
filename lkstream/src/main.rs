//! Minimal daemon bootstrap: load configuration, open the broker, and run
//! its background durability and retention tasks until interrupted. A
//! network-facing transport (gRPC/TCP/HTTP) is out of scope (spec.md §1) —
//! this binary exists so the crate is runnable standalone during
//! development and in tests, the way the teacher ships a thin `main.rs` in
//! front of its `System`.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lkstream::broker::Broker;
use lkstream::config::Config;
use lkstream::retention::RetentionSweeper;

#[derive(Parser, Debug)]
#[command(name = "lkstream-server", about = "Single-node append-only event log")]
struct Args {
    /// Path to a TOML config file, layered over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    tracing::info!(persist_dir = %config.persist_dir.display(), "starting lkstream");

    let broker = Broker::open(config.clone()).await?;

    let scheduler = broker.scheduler();
    let (scheduler_shutdown_tx, scheduler_shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_broker = broker.clone();
    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .run(
                    move |topic, pid| scheduler_broker.partition(topic, pid).ok(),
                    scheduler_shutdown_rx,
                )
                .await;
        }
    });

    let retention = RetentionSweeper::new(std::sync::Arc::new(config));
    let (retention_shutdown_tx, retention_shutdown_rx) = tokio::sync::oneshot::channel();
    let retention_broker = broker.clone();
    let retention_handle = tokio::spawn(async move {
        retention.run(retention_broker, retention_shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    broker.close().await;

    let _ = scheduler_shutdown_tx.send(());
    let _ = retention_shutdown_tx.send(());
    let _ = scheduler_handle.await;
    let _ = retention_handle.await;

    Ok(())
}
