//! HTTP reverse-proxy gateway.
//!
//! For each inbound request the pipeline runs, in order: normalization and
//! admission, route resolution, authentication/authorization, quota
//! enforcement, and circuit-breaker-guarded upstream dispatch with
//! retry/backoff. Cross-request state is limited to the in-memory breaker
//! table and the counters held in the external store; everything else is
//! per-request.

// Pipeline stages
pub mod auth;
pub mod circuit_breaker;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod routing;

// Cross-cutting concerns
pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod metrics;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use pipeline::{build_router, AppState};

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
