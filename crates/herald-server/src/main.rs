//! # Herald Server
//!
//! Realtime fan-out gateway for chat.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory store, one process)
//! HERALD_JWT_SECRET=secret herald
//!
//! # Run with a custom config
//! HERALD_CONFIG=/path/to/herald.toml herald
//!
//! # Override any key from the environment
//! HERALD__STORE__BACKEND=redis HERALD__CLUSTER__WORKERS=4 herald
//! ```

use anyhow::{bail, Context, Result};
use herald_core::{Collaborators, CoordinationStore, Gateway, JwtVerifier, MemoryStore};
use herald_server::config::{Config, StoreBackend};
use herald_server::supervisor::{self, Supervisor};
use herald_server::worker::{self, RelayStore};
use herald_server::{handlers, metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing. Stdout is reserved for the supervisor control
    // channel, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,herald_core=debug,herald_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let config = Config::load()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            supervisor::shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let worker_id = worker::worker_id();
    if worker_id.is_none() && config.cluster.worker_count() > 1 {
        return Supervisor::new(&config).run(shutdown).await;
    }

    run_worker(config, worker_id, shutdown).await
}

async fn run_worker(
    config: Config,
    worker_id: Option<usize>,
    shutdown: CancellationToken,
) -> Result<()> {
    if config.auth.jwt_secret.is_empty() {
        bail!("auth.jwt_secret (or HERALD_JWT_SECRET) must be set");
    }

    tracing::info!(
        worker = ?worker_id,
        "Starting Herald server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
        let port = config.metrics.port.saturating_add(worker_id.unwrap_or(0) as u16);
        if let Err(e) = metrics::start_metrics_server(port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let store = build_store(&config, worker_id, &shutdown).await?;
    let collaborators =
        Collaborators::new(Arc::new(JwtVerifier::hs256(config.auth.jwt_secret.as_bytes())));
    let gateway = Arc::new(Gateway::new(store, collaborators, config.gateway_settings()));
    gateway
        .start()
        .await
        .context("Failed to start broadcast engine")?;

    if config.metrics.enabled {
        metrics::spawn_reporter(
            gateway.clone(),
            Duration::from_millis(config.metrics.report_interval_ms),
            shutdown.clone(),
        );
    }

    // Start the server
    let result = handlers::run_server(config, gateway.clone(), shutdown, worker_id.is_some()).await;
    gateway.shutdown();
    result
}

/// Build the coordination store, wiring the supervisor relay for workers.
async fn build_store(
    config: &Config,
    worker_id: Option<usize>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn CoordinationStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            let store: Arc<dyn CoordinationStore> = match worker_id {
                Some(_) => {
                    let relay = worker::attach_stdio(Some(memory.clone()), shutdown.clone());
                    Arc::new(RelayStore::new(memory, relay))
                }
                None => memory,
            };
            Ok(store)
        }
        StoreBackend::Redis => {
            if worker_id.is_some() {
                // Only `shutdown` travels over the control channel.
                drop(worker::attach_stdio(None, shutdown.clone()));
            }
            connect_redis(&config.store.url).await
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> Result<Arc<dyn CoordinationStore>> {
    let store = herald_core::RedisStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> Result<Arc<dyn CoordinationStore>> {
    bail!("This build does not include the redis backend")
}
