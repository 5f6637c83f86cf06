// ============================================================================
// Administrative Surface
// ============================================================================
//
// Read-only: route list with aggregate stats, breaker snapshots, rate-limit
// status for an identity, metrics summary and full dump. Mutating: add or
// remove a route, reset a breaker, reset a rate-limit identity, swap in a
// fresh metrics aggregator. Token minting is development-only.
//
// These endpoints bypass the proxy pipeline; they still carry the request
// id like every other response.
//
// ============================================================================

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::TokenRequest;
use crate::error::{ErrorEnvelope, GatewayError};
use crate::pipeline::{AppState, RequestId};

type AdminResult = Result<Json<Value>, ErrorEnvelope>;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/routes",
            get(list_routes).post(add_route).delete(remove_route),
        )
        .route("/breakers", get(list_breakers))
        .route("/breakers/reset", post(reset_breaker))
        .route("/rate-limit", get(rate_limit_status))
        .route("/rate-limit/reset", post(reset_rate_limit))
        .route("/metrics", get(metrics_summary))
        .route("/metrics/dump", get(metrics_dump))
        .route("/metrics/reset", post(metrics_reset))
        .route("/token", post(mint_token))
}

fn fail(err: GatewayError, request_id: &str, state: &AppState) -> ErrorEnvelope {
    err.into_envelope(request_id, state.config.environment.is_production())
}

// ===== Routes =====

async fn list_routes(State(state): State<Arc<AppState>>) -> Json<Value> {
    let routes = state.routes.definitions().await;
    Json(json!({
        "count": routes.len(),
        "routes": routes,
        "stats": state.metrics.summary(),
    }))
}

async fn add_route(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(definition): Json<crate::config::RouteDefinition>,
) -> AdminResult {
    let path = definition.path.clone();
    state.routes.add(definition).await.map_err(|e| {
        fail(
            GatewayError::Validation(format!("route rejected: {}", e)),
            &request_id,
            &state,
        )
    })?;
    tracing::info!(path = %path, "route added");
    Ok(Json(json!({ "added": path })))
}

#[derive(Deserialize)]
struct RemoveRouteQuery {
    path: String,
}

async fn remove_route(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemoveRouteQuery>,
) -> Json<Value> {
    let removed = state.routes.remove(&query.path).await;
    if removed > 0 {
        tracing::info!(path = %query.path, removed, "route removed");
    }
    Json(json!({ "path": query.path, "removed": removed }))
}

// ===== Circuit breakers =====

async fn list_breakers(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "breakers": state.breakers.snapshots().await }))
}

#[derive(Deserialize)]
struct BreakerResetRequest {
    service: String,
}

async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<BreakerResetRequest>,
) -> AdminResult {
    if state.breakers.reset(&request.service).await {
        Ok(Json(json!({ "reset": request.service })))
    } else {
        Err(fail(
            GatewayError::Validation(format!("no breaker for service {:?}", request.service)),
            &request_id,
            &state,
        ))
    }
}

// ===== Rate limits =====

#[derive(Deserialize)]
struct RateLimitQuery {
    identity: String,
    tier: String,
}

async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<RateLimitQuery>,
) -> AdminResult {
    let status = state
        .limiter
        .status(&query.identity, &query.tier)
        .await
        .map_err(|e| fail(e, &request_id, &state))?;
    Ok(Json(json!(status)))
}

async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<RateLimitQuery>,
) -> AdminResult {
    let deleted = state
        .limiter
        .reset(&request.identity, &request.tier)
        .await
        .map_err(|e| fail(e, &request_id, &state))?;
    tracing::info!(
        identity = %request.identity,
        tier = %request.tier,
        deleted,
        "rate-limit counters reset"
    );
    Ok(Json(json!({
        "identity": request.identity,
        "tier": request.tier,
        "deleted": deleted,
    })))
}

// ===== Metrics =====

async fn metrics_summary(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.summary())
}

async fn metrics_dump(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.dump())
}

async fn metrics_reset(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.metrics.reset();
    Json(json!({ "reset": true }))
}

// ===== Test tokens (development only) =====

async fn mint_token(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<TokenRequest>,
) -> AdminResult {
    if state.config.environment.is_production() {
        return Err(fail(
            GatewayError::InsufficientPermissions {
                required: vec!["development environment".into()],
            },
            &request_id,
            &state,
        ));
    }

    let token = state
        .auth
        .mint_token(&request)
        .map_err(|e| fail(e, &request_id, &state))?;
    Ok(Json(json!({ "token": token, "subject": request.subject })))
}
