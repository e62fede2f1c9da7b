//! Jobrelay Server - Entry Point
//!
//! Starts the broker and the API server with graceful shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobrelay::api::ApiServer;
use jobrelay::bus::{InMemoryBus, MessageBus, RedisBus};
use jobrelay::config::{BackendKind, Config, LogConfig};
use jobrelay::heartbeat::{HeartbeatStore, InMemoryHeartbeatStore, RedisHeartbeatStore};
use jobrelay::Broker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing(&config.log);
    info!("Starting Jobrelay Server");

    let (bus, store) = connect_backends(&config).await?;

    let broker = Arc::new(Broker::new(config.broker_config(), bus, store));
    broker
        .start()
        .await
        .context("failed to start job broker")?;

    // Start API server
    let (shutdown_tx, api_shutdown) = watch::channel(false);
    let api_server = ApiServer::new(config.api.clone(), broker.clone());
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!("Server started - API: {}", config.api_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    broker.stop().await;
    let _ = api_task.await;

    info!("Jobrelay Server stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("jobrelay={},tower_http=info", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the event bus and heartbeat store for the configured backend
async fn connect_backends(
    config: &Config,
) -> anyhow::Result<(Arc<dyn MessageBus>, Arc<dyn HeartbeatStore>)> {
    match config.backend.kind {
        BackendKind::Redis => {
            let client = redis::Client::open(config.backend.redis_url.as_str())
                .context("invalid REDIS_URL")?;
            let manager = redis::aio::ConnectionManager::new(client.clone())
                .await
                .context("failed to connect to Redis")?;
            info!("Connected to Redis");

            let bus: Arc<dyn MessageBus> = Arc::new(RedisBus::from_parts(client, manager.clone()));
            let store: Arc<dyn HeartbeatStore> =
                Arc::new(RedisHeartbeatStore::from_connection(manager));
            Ok((bus, store))
        }
        BackendKind::Memory => {
            info!("Using in-memory event bus and heartbeat store");
            let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
            let store: Arc<dyn HeartbeatStore> = Arc::new(InMemoryHeartbeatStore::new());
            Ok((bus, store))
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
