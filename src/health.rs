// ============================================================================
// Health Probes
// ============================================================================
//
// Three depths:
// - /health/live  — the process is up
// - /health/ready — gated on the counter store and the shutdown flag;
//                   flips to 503 the moment draining starts
// - /health/deep  — filesystem write probe, scheduler-lag probe and
//                   configuration validity
//
// These bypass the proxy pipeline entirely.
//
// ============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::pipeline::AppState;

/// Scheduler lag beyond this is reported as degraded.
const SCHEDULER_LAG_BUDGET_MS: u64 = 100;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/deep", get(deep))
}

async fn live(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.ready.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        );
    }

    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe: counter store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "counterStore": "unreachable",
                })),
            )
        }
    }
}

async fn deep(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let filesystem_ok = filesystem_probe();
    let lag_ms = scheduler_lag_ms().await;
    let scheduler_ok = lag_ms <= SCHEDULER_LAG_BUDGET_MS;
    let config_ok = state.config.validate().is_ok();
    let store_ok = state.store.ping().await.is_ok();

    let healthy = filesystem_ok && scheduler_ok && config_ok && store_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "checks": {
                "filesystem": if filesystem_ok { "ok" } else { "failed" },
                "scheduler": { "lagMs": lag_ms, "ok": scheduler_ok },
                "config": if config_ok { "ok" } else { "invalid" },
                "counterStore": if store_ok { "ok" } else { "unreachable" },
            },
        })),
    )
}

/// Write-and-remove a probe file under the temp directory.
fn filesystem_probe() -> bool {
    let path = std::env::temp_dir().join(format!("gateway-health-{}", std::process::id()));
    match std::fs::write(&path, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&path);
            true
        }
        Err(err) => {
            tracing::warn!(error = %err, "filesystem probe failed");
            false
        }
    }
}

/// How late a 10 ms sleep fires; a loaded or stalled runtime shows up here.
async fn scheduler_lag_ms() -> u64 {
    let requested = Duration::from_millis(10);
    let before = Instant::now();
    tokio::time::sleep(requested).await;
    before.elapsed().saturating_sub(requested).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_probe_succeeds_on_a_writable_tmp() {
        assert!(filesystem_probe());
    }

    #[tokio::test]
    async fn scheduler_lag_is_small_on_an_idle_runtime() {
        assert!(scheduler_lag_ms().await < SCHEDULER_LAG_BUDGET_MS);
    }
}
