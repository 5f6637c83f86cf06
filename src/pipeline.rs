// ============================================================================
// Pipeline Orchestrator
// ============================================================================
//
// The per-request chain: admission -> resolve -> auth -> rate limit ->
// dispatch. The chain's shape follows the matched route (auth mode, tier)
// by inspecting the route inline; health, admin and ping bypass it
// entirely.
//
// Every terminal error passes through the single mapper in `error.rs`, and
// every response (success, error, bypass) carries `X-Request-ID` via the
// request-id middleware at the outer layer.
//
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, Response, Uri};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthManager};
use crate::circuit_breaker::BreakerRegistry;
use crate::config::{
    Config, MAX_HEADER_COUNT, MAX_HEADER_NAME_BYTES, MAX_HEADER_VALUE_BYTES, MAX_REQUEST_BODY_BYTES,
    MAX_URL_LENGTH,
};
use crate::context::{request_id_from_headers, RequestContext};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::Metrics;
use crate::proxy::UpstreamDispatcher;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::routing::RouteTable;
use crate::store::CounterStore;
use crate::utils::extract_client_ip;
use crate::{admin, health};

/// Methods the gateway is willing to carry at all.
const ALLOWED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
    Method::HEAD,
];

/// Request id as stashed in request extensions by the outer middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub struct AppState {
    pub config: Arc<Config>,
    pub routes: Arc<RouteTable>,
    pub auth: Arc<AuthManager>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<UpstreamDispatcher>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: Arc<Metrics>,
    pub store: Arc<dyn CounterStore>,
    /// Flipped to false when shutdown begins; readiness follows it.
    pub ready: Arc<AtomicBool>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the pipeline from configuration and a counter store. Route
    /// compilation failures surface here and are fatal at startup.
    pub fn build(config: Config, store: Arc<dyn CounterStore>) -> Result<Arc<Self>> {
        let routes = Arc::new(RouteTable::new(config.routes.clone())?);
        let auth = Arc::new(AuthManager::new(&config.jwt));
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let dispatcher = Arc::new(UpstreamDispatcher::new(breakers.clone()));

        Ok(Arc::new(AppState {
            config: Arc::new(config),
            routes,
            auth,
            limiter,
            dispatcher,
            breakers,
            metrics: Arc::new(Metrics::new()),
            store,
            ready: Arc::new(AtomicBool::new(true)),
            started_at: Instant::now(),
        }))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .nest("/health", health::router())
        .nest("/admin", admin::router())
        .fallback(handle_proxy)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_id_middleware))
                .into_inner(),
        )
        .with_state(state)
}

/// Assigns the request id (echoing a well-formed client one) and stamps it
/// on the response whatever the outcome.
async fn request_id_middleware(mut request: Request, next: Next) -> axum::response::Response {
    let request_id = request_id_from_headers(request.headers());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn ping(Extension(RequestId(request_id)): Extension<RequestId>) -> impl IntoResponse {
    Json(json!({ "status": "pong", "requestId": request_id }))
}

/// The proxying fallback: everything that is not ping/health/admin.
async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> axum::response::Response {
    let started = Instant::now();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| request_id_from_headers(request.headers()));
    let peer_ip = connect_info.map(|ConnectInfo(addr)| addr.ip());

    let mut route_label = String::from("unmatched");
    let mut decision: Option<RateLimitDecision> = None;

    let result = run_pipeline(
        &state,
        &request_id,
        peer_ip,
        request,
        &mut route_label,
        &mut decision,
    )
    .await;

    let mut response = match result {
        Ok(response) => response.into_response(),
        Err(err) => err
            .into_envelope(&request_id, state.config.environment.is_production())
            .into_response(),
    };

    if let Some(decision) = &decision {
        decision.apply_headers(response.headers_mut());
    }

    state.metrics.record(
        &route_label,
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
    );
    response
}

async fn run_pipeline(
    state: &AppState,
    request_id: &str,
    peer_ip: Option<IpAddr>,
    request: Request<Body>,
    route_label: &mut String,
    decision_out: &mut Option<RateLimitDecision>,
) -> GatewayResult<Response<Body>> {
    let (parts, body) = request.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let headers = parts.headers;

    // ----- admission -----
    check_method(&method)?;
    check_url(&uri)?;
    check_headers(&headers)?;
    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge(MAX_REQUEST_BODY_BYTES))?;
    check_json_body(&headers, &body)?;

    let client_ip = extract_client_ip(&headers, peer_ip);
    let mut ctx = RequestContext::new(request_id.to_string(), client_ip);

    // ----- resolve -----
    let matched = state.routes.resolve(&method, uri.path()).await.ok_or_else(|| {
        GatewayError::RouteNotFound {
            method: method.to_string(),
            path: uri.path().to_string(),
        }
    })?;
    route_label.clone_from(&matched.route.path);
    ctx.route = Some(matched.route.clone());
    ctx.params = matched.params;

    // ----- auth -----
    ctx.user = state
        .auth
        .authenticate(&headers, matched.route.auth_required)?;
    auth::authorize(&matched.route, ctx.user.as_ref())?;

    // ----- rate limit -----
    let tier = RateLimiter::effective_tier(
        ctx.user.as_ref().and_then(|u| u.tier.as_deref()),
        matched.route.rate_limit_tier.as_deref(),
    )
    .to_string();
    ctx.tags.insert("tier".to_string(), tier.clone());
    ctx.tags
        .insert("service".to_string(), matched.route.service_key());

    let decision = state.limiter.check(&ctx.identity(), &tier).await;
    let (allowed, limit, reset) = (decision.allowed, decision.limit, decision.reset_epoch_secs);
    *decision_out = Some(decision);
    if !allowed {
        return Err(GatewayError::RateLimitExceeded {
            tier,
            limit,
            reset_epoch_secs: reset,
        });
    }

    // ----- dispatch -----
    state
        .dispatcher
        .dispatch(
            &ctx,
            &matched.route,
            &method,
            &uri,
            &headers,
            body,
            &matched.rest,
        )
        .await
}

fn check_method(method: &Method) -> GatewayResult<()> {
    if ALLOWED_METHODS.contains(method) {
        Ok(())
    } else {
        Err(GatewayError::MethodNotAllowed(method.to_string()))
    }
}

fn check_url(uri: &Uri) -> GatewayResult<()> {
    if uri.to_string().len() > MAX_URL_LENGTH {
        Err(GatewayError::UriTooLong(MAX_URL_LENGTH))
    } else {
        Ok(())
    }
}

fn check_headers(headers: &HeaderMap) -> GatewayResult<()> {
    if headers.len() > MAX_HEADER_COUNT {
        return Err(GatewayError::Validation(format!(
            "too many headers: {} (limit {})",
            headers.len(),
            MAX_HEADER_COUNT
        )));
    }
    for (name, value) in headers {
        if name.as_str().len() > MAX_HEADER_NAME_BYTES {
            return Err(GatewayError::Validation(format!(
                "header name exceeds {} bytes",
                MAX_HEADER_NAME_BYTES
            )));
        }
        if value.len() > MAX_HEADER_VALUE_BYTES {
            return Err(GatewayError::Validation(format!(
                "header {} value exceeds {} bytes",
                name, MAX_HEADER_VALUE_BYTES
            )));
        }
    }
    Ok(())
}

/// Bodies declared as JSON must parse as JSON before they travel upstream.
fn check_json_body(headers: &HeaderMap, body: &[u8]) -> GatewayResult<()> {
    let is_json = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);
    if is_json && !body.is_empty() {
        serde_json::from_slice::<serde_json::Value>(body)
            .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {}", e)))?;
    }
    Ok(())
}
