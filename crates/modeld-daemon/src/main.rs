//! modeld worker
//!
//! Hosts stateful models behind a job queue and a REST API, checkpointing
//! their state to disk.

use clap::Parser;
use modeld_api::create_router;
use modeld_core::{FlushMode, ModeldError, ModeldResult, WorkerConfig};
use modeld_network::MemoryQueue;
use modeld_scheduler::{serve, Dispatcher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// modeld - stateful model-serving worker
#[derive(Parser, Debug)]
#[command(name = "modeld")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding entity checkpoints
    #[arg(long)]
    checkpoint_root: Option<PathBuf>,

    /// Maximum number of resident models
    #[arg(long)]
    capacity: Option<usize>,

    /// Write back evicted models before replying instead of in the background
    #[arg(long)]
    inline_flush: bool,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> ModeldResult<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)?,
            None => WorkerConfig::default(),
        };

        if let Some(address) = self.address {
            config.api.rest_address = address;
        }
        if let Some(port) = self.port {
            config.api.rest_port = port;
        }
        if let Some(root) = self.checkpoint_root {
            config.storage.checkpoint_root = root;
        }
        if let Some(capacity) = self.capacity {
            config.cache.capacity = capacity;
        }
        if self.inline_flush {
            config.cache.flush_mode = FlushMode::Inline;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("modeld: {}", e);
            std::process::exit(2);
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("modeld: failed to set subscriber: {}", e);
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "modeld exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: WorkerConfig) -> ModeldResult<()> {
    info!("Starting modeld v{}", env!("CARGO_PKG_VERSION"));

    let dispatcher = Dispatcher::from_config(&config)?;
    dispatcher.store().init().await?;

    let (queue, client) = MemoryQueue::new(
        config.dispatcher.queue_depth,
        config.dispatcher.job_timeout(),
    );

    // The worker keeps running until the API server has drained.
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let worker = tokio::spawn(serve(
        Arc::new(queue),
        dispatcher.clone(),
        config.dispatcher.max_inflight,
        async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        },
    ));

    let router = create_router(client, dispatcher.clone());

    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, config.api.rest_port)
        .parse()
        .map_err(|e| ModeldError::Config(format!("invalid listen address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        address = %addr,
        checkpoint_root = %config.storage.checkpoint_root.display(),
        capacity = config.cache.capacity,
        "API server listening"
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = stop_tx.send(true);
    if let Err(e) = worker.await {
        warn!(error = %e, "Job worker ended abnormally");
    }

    info!("Flushing models before exit");
    match dispatcher.flush_all().await {
        Ok(report) => info!(flushed = report.flushed.len(), "All models flushed"),
        Err(e) => error!(error = %e, "Some models could not be flushed"),
    }

    served?;
    info!("modeld stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "modeld",
            "--port",
            "9191",
            "--capacity",
            "3",
            "--inline-flush",
            "--checkpoint-root",
            "/tmp/ckpt",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.api.rest_port, 9191);
        assert_eq!(config.cache.capacity, 3);
        assert_eq!(config.cache.flush_mode, FlushMode::Inline);
        assert_eq!(config.storage.checkpoint_root, PathBuf::from("/tmp/ckpt"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let args = Args::parse_from(["modeld", "--capacity", "0"]);
        assert!(args.into_config().is_err());
    }
}
