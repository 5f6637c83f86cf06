// ============================================================================
// Gateway Binary
// ============================================================================
//
// Startup order: configuration, tracing, counter store, pipeline state,
// router, listener. Shutdown: SIGINT/SIGTERM flips readiness to 503, the
// server stops accepting and drains in-flight requests within a bounded
// window, then the process exits. Fatal startup errors (bad config, invalid
// route pattern, bind failure) exit non-zero.
//
// ============================================================================

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_gateway::circuit_breaker::CircuitState;
use edge_gateway::store::{CounterStore, RedisStore};
use edge_gateway::{build_router, shutdown_signal, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    info!(
        port = config.port,
        environment = ?config.environment,
        routes = config.routes.len(),
        "gateway starting"
    );

    let store: Arc<dyn CounterStore> =
        Arc::new(RedisStore::new(&config.redis.url()).context("invalid counter store URL")?);
    if let Err(err) = store.ping().await {
        warn!(error = %err, "counter store unreachable at startup; rate limiting will fail open");
    }

    let drain = Duration::from_secs(config.shutdown_drain_secs);
    let state = AppState::build(config, store).context("failed to build pipeline")?;
    let app = build_router(state.clone());

    spawn_breaker_monitor(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "gateway listening");

    // Signal handling: flip readiness first so the load balancer stops
    // sending traffic, then let the server drain.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ready = state.ready.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        ready.store(false, Ordering::SeqCst);
        info!("shutdown signal received; draining in-flight requests");
        let _ = shutdown_tx.send(true);
    });

    let graceful = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .into_future();

    tokio::select! {
        result = server => result.context("server error")?,
        _ = drain_deadline(shutdown_rx, drain) => {
            warn!(drain_secs = drain.as_secs(), "drain window elapsed with requests still in flight");
        }
    }

    info!("gateway stopped");
    Ok(())
}

/// Resolves `drain` after the shutdown signal fires; bounds how long we wait
/// for in-flight requests.
async fn drain_deadline(mut shutdown_rx: watch::Receiver<bool>, drain: Duration) {
    let _ = shutdown_rx.changed().await;
    tokio::time::sleep(drain).await;
}

/// Periodically surfaces breakers that are not CLOSED, on the configured
/// monitor interval.
fn spawn_breaker_monitor(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.config.breaker.monitor_timeout_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            for snapshot in state.breakers.snapshots().await {
                if snapshot.state != CircuitState::Closed {
                    tracing::warn!(
                        service = %snapshot.service,
                        state = ?snapshot.state,
                        failures = snapshot.failure_count,
                        "circuit breaker not closed"
                    );
                }
            }
        }
    });
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {:?}", path))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}
