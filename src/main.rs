use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use social_relay::api;
use social_relay::channel::TelegramChannel;
use social_relay::config;
use social_relay::dispatcher::Dispatcher;
use social_relay::poller::{Poller, PollerConfig};
use social_relay::queue::{QueueFactory, QueueSettings};
use social_relay::source::SourceRegistry;
use social_relay::storage::{StorageFactory, StorageSettings};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file (optional; environment variables override it)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load_with_env(&args.config)?;
    cfg.ensure_dirs()?;

    // Resolve both backends once, before anything consumes them.
    let storage = Arc::new(StorageFactory::new(StorageSettings::from_config(&cfg)));
    let queue = Arc::new(QueueFactory::new(QueueSettings::from_config(&cfg)));
    let active_storage = storage.get_storage().await;
    let active_queue = queue.get_queue().await;
    info!(storage = %active_storage.kind(), queue = %active_queue.kind(), "backends resolved");

    let channel = Arc::new(TelegramChannel::new(cfg.bot_token()));
    {
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(err) = channel.authenticate().await {
                error!(?err, "telegram authentication failed");
                return;
            }
            if channel.is_ready() {
                channel.track_chats().await;
            }
        });
    }

    let dispatcher = Arc::new(Dispatcher::new(storage.clone(), channel.clone()));
    active_queue
        .consume(dispatcher)
        .await
        .context("failed to start consumer")?;

    let sources = SourceRegistry::from_config(&cfg)?;
    let poller = Poller::new(
        storage.clone(),
        queue.clone(),
        sources,
        PollerConfig {
            interval: cfg.poll_interval(),
            startup_delay: cfg.startup_delay(),
        },
    );
    tokio::spawn(poller.run());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "http server listening");
    axum::serve(listener, api::router(storage.clone(), channel))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("shutting down");
    if let Err(err) = active_storage.disconnect().await {
        warn!(?err, "storage disconnect failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
