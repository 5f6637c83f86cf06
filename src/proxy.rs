// ============================================================================
// Upstream Dispatcher
// ============================================================================
//
// Builds the upstream request from the inbound one (hop-by-hop headers
// stripped, forwarding and identity headers injected), gates the whole
// operation on the service's circuit breaker, and retries transient
// failures with capped exponential backoff.
//
// One breaker failure is recorded per dispatched request (the final
// outcome), not per attempt; a breaker rejection never reaches the retry
// loop at all.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, Method, Response, Uri};
use bytes::Bytes;
use rand::Rng;

use crate::circuit_breaker::BreakerRegistry;
use crate::config::DEFAULT_CLIENT_TIMEOUT_SECS;
use crate::context::RequestContext;
use crate::error::{GatewayError, GatewayResult};
use crate::routing::Route;

/// Value of the `X-Gateway-Service` header stamped on every proxied
/// response.
pub const GATEWAY_SERVICE_ID: &str = "edge-gateway";

/// Headers scoped to a single transport hop; never forwarded in either
/// direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const RETRY_BASE_DELAY_MS: u64 = 1_000;
const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Upstream HTTP statuses that are never retried.
const NO_RETRY_STATUSES: [u16; 5] = [400, 401, 403, 404, 422];

/// Where an upstream attempt failed.
#[derive(Debug)]
enum UpstreamFailure {
    ConnectionRefused(String),
    Timeout,
    Status(u16),
    Other(String),
}

impl UpstreamFailure {
    fn is_terminal(&self) -> bool {
        matches!(self, UpstreamFailure::Status(s) if NO_RETRY_STATUSES.contains(s))
    }

    fn into_error(self, service: &str) -> GatewayError {
        match self {
            UpstreamFailure::ConnectionRefused(_) => GatewayError::ServiceUnavailable {
                service: service.to_string(),
            },
            UpstreamFailure::Timeout => GatewayError::GatewayTimeout {
                service: service.to_string(),
            },
            UpstreamFailure::Status(status) => GatewayError::UpstreamError {
                service: service.to_string(),
                status,
            },
            UpstreamFailure::Other(message) => GatewayError::BadGateway {
                service: service.to_string(),
                message,
            },
        }
    }
}

pub struct UpstreamDispatcher {
    client: reqwest::Client,
    breakers: Arc<BreakerRegistry>,
}

impl UpstreamDispatcher {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build upstream HTTP client");

        Self { client, breakers }
    }

    /// Run the breaker-guarded, retry-wrapped upstream call and shape the
    /// response for the client.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        route: &Route,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        matched_rest: &str,
    ) -> GatewayResult<Response<Body>> {
        let service = route.service_key();
        let target = route.target_url(uri.path(), uri.query(), matched_rest);

        let breaker = self.breakers.get_or_create(&service).await;
        breaker.acquire().await?;

        let upstream_headers = build_upstream_headers(ctx, route, headers);

        match self
            .send_with_retry(route, method, &target, &upstream_headers, &body)
            .await
        {
            Ok(response) => {
                breaker.record_success().await;
                tracing::debug!(
                    request_id = %ctx.request_id,
                    service = %service,
                    status = response.status().as_u16(),
                    elapsed_ms = ctx.elapsed_ms(),
                    "upstream dispatch succeeded"
                );
                shape_response(&ctx.request_id, &service, response).await
            }
            Err(failure) => {
                breaker.record_failure().await;
                tracing::warn!(
                    request_id = %ctx.request_id,
                    service = %service,
                    failure = ?failure,
                    "upstream dispatch failed"
                );
                Err(failure.into_error(&service))
            }
        }
    }

    async fn send_with_retry(
        &self,
        route: &Route,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let attempts = route.retries + 1;
        let mut last_failure = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = retry_delay(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    target = %target,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_once(route, method, target, headers, body).await {
                Ok(response) => return Ok(response),
                Err(failure) => {
                    if failure.is_terminal() {
                        return Err(failure);
                    }
                    last_failure = Some(failure);
                }
            }
        }

        Err(last_failure
            .unwrap_or_else(|| UpstreamFailure::Other("retry budget was zero".into())))
    }

    async fn send_once(
        &self,
        route: &Route,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let mut request = self
            .client
            .request(method.clone(), target)
            .timeout(route.timeout)
            .headers(headers.clone());

        // only mutating methods carry a body upstream
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH) && !body.is_empty() {
            request = request.body(body.clone());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status >= 400 {
                    Err(UpstreamFailure::Status(status))
                } else {
                    Ok(response)
                }
            }
            Err(e) if e.is_timeout() => Err(UpstreamFailure::Timeout),
            Err(e) if e.is_connect() => Err(UpstreamFailure::ConnectionRefused(e.to_string())),
            Err(e) => Err(UpstreamFailure::Other(e.to_string())),
        }
    }
}

/// Delay before zero-based attempt `i >= 1`:
/// `min(1000 * 2^(i-1), 10_000)` ms plus uniform jitter in `[0, delay/10)`.
fn retry_delay(attempt: u32) -> Duration {
    let exponential = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = RETRY_BASE_DELAY_MS
        .saturating_mul(exponential)
        .min(RETRY_MAX_DELAY_MS);
    let jitter_range = base / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(base + jitter)
}

/// Copy inbound headers minus the hop-by-hop set, then add the forwarding
/// and identity headers the upstream expects.
fn build_upstream_headers(ctx: &RequestContext, route: &Route, inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();

    for (name, value) in inbound {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower) || lower == "host" || lower == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    // X-Forwarded-For: append our caller to any existing chain
    let forwarded_for = match inbound.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, ctx.client_ip),
        None => ctx.client_ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        out.insert("x-forwarded-for", value);
    }
    out.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = inbound.get(HOST) {
        out.insert("x-forwarded-host", host.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        out.insert("x-request-id", value);
    }

    if let Some(user) = &ctx.user {
        if let Ok(value) = HeaderValue::from_str(&user.subject) {
            out.insert("x-user-id", value);
        }
        if !user.roles.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&user.roles.join(",")) {
                out.insert("x-user-roles", value);
            }
        }
        if let Some(tier) = &user.tier {
            if let Ok(value) = HeaderValue::from_str(tier) {
                out.insert("x-user-tier", value);
            }
        }
    }

    // Host travels through only when the route pins it; otherwise the
    // client sets it from the target authority
    if route.preserve_host {
        if let Some(host) = inbound.get(HOST) {
            out.insert(HOST, host.clone());
        }
    }

    out
}

/// Copy upstream status and headers (minus hop-by-hop), stamp the gateway
/// identity and request id, then write the body.
async fn shape_response(
    request_id: &str,
    service: &str,
    upstream: reqwest::Response,
) -> GatewayResult<Response<Body>> {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let body = upstream.bytes().await.map_err(|e| GatewayError::BadGateway {
        service: service.to_string(),
        message: format!("failed to read upstream body: {}", e),
    })?;

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &upstream_headers {
            let lower = name.as_str();
            if HOP_BY_HOP_HEADERS.contains(&lower) || lower == "content-length" {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(
            "x-gateway-service",
            HeaderValue::from_static(GATEWAY_SERVICE_ID),
        );
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", value);
        }
    }

    builder
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(format!("failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteDefinition;
    use crate::context::UserContext;

    fn route(preserve_host: bool) -> Route {
        Route::from_definition(RouteDefinition {
            path: "/api/users".into(),
            target: "http://users.internal:3001".into(),
            timeout_ms: None,
            retries: None,
            auth_required: None,
            rate_limit_tier: None,
            methods: vec!["GET".into()],
            strip_path: None,
            preserve_host: Some(preserve_host),
            change_origin: None,
            required_roles: vec![],
            required_permissions: vec![],
        })
        .unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::new("req-123".into(), "203.0.113.9".into())
    }

    #[test]
    fn retry_delay_is_bounded_and_grows() {
        let mut previous_floor = 0u64;
        for attempt in 1..=6u32 {
            let floor = (RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(RETRY_MAX_DELAY_MS);
            let delay = retry_delay(attempt).as_millis() as u64;
            assert!(delay >= floor, "attempt {}: {} < {}", attempt, delay, floor);
            assert!(delay < floor + floor / 10 + 1);
            assert!(floor >= previous_floor);
            previous_floor = floor;
        }
        // the cap holds forever
        assert!(retry_delay(30).as_millis() as u64 <= RETRY_MAX_DELAY_MS + RETRY_MAX_DELAY_MS / 10);
    }

    #[test]
    fn terminal_statuses_do_not_retry() {
        for status in NO_RETRY_STATUSES {
            assert!(UpstreamFailure::Status(status).is_terminal());
        }
        assert!(!UpstreamFailure::Status(409).is_terminal());
        assert!(!UpstreamFailure::Status(429).is_terminal());
        assert!(!UpstreamFailure::Status(500).is_terminal());
        assert!(!UpstreamFailure::Timeout.is_terminal());
        assert!(!UpstreamFailure::ConnectionRefused("x".into()).is_terminal());
    }

    #[test]
    fn failure_mapping_matches_the_table() {
        let service = "users.internal:3001";
        assert!(matches!(
            UpstreamFailure::ConnectionRefused("refused".into()).into_error(service),
            GatewayError::ServiceUnavailable { .. }
        ));
        assert!(matches!(
            UpstreamFailure::Timeout.into_error(service),
            GatewayError::GatewayTimeout { .. }
        ));
        assert!(matches!(
            UpstreamFailure::Status(502).into_error(service),
            GatewayError::UpstreamError { status: 502, .. }
        ));
        assert!(matches!(
            UpstreamFailure::Other("tls".into()).into_error(service),
            GatewayError::BadGateway { .. }
        ));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        inbound.insert("upgrade", HeaderValue::from_static("h2c"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));

        let headers = build_upstream_headers(&ctx(), &route(false), &inbound);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("upgrade").is_none());
        assert_eq!(headers["accept"], "application/json");
    }

    #[test]
    fn forwarding_headers_are_injected() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("gw.example.com"));

        let headers = build_upstream_headers(&ctx(), &route(false), &inbound);
        assert_eq!(headers["x-forwarded-for"], "203.0.113.9");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert_eq!(headers["x-forwarded-host"], "gw.example.com");
        assert_eq!(headers["x-request-id"], "req-123");
        // host is dropped unless the route preserves it
        assert!(headers.get(HOST).is_none());
    }

    #[test]
    fn forwarded_for_chain_is_appended() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        let headers = build_upstream_headers(&ctx(), &route(false), &inbound);
        assert_eq!(headers["x-forwarded-for"], "198.51.100.7, 203.0.113.9");
    }

    #[test]
    fn identity_headers_follow_the_user_context() {
        let mut context = ctx();
        context.user = Some(UserContext {
            subject: "u-7".into(),
            username: None,
            email: None,
            roles: vec!["admin".into(), "ops".into()],
            permissions: vec![],
            tier: Some("premium".into()),
            issued_at: None,
            expires_at: 0,
        });

        let headers = build_upstream_headers(&context, &route(false), &HeaderMap::new());
        assert_eq!(headers["x-user-id"], "u-7");
        assert_eq!(headers["x-user-roles"], "admin,ops");
        assert_eq!(headers["x-user-tier"], "premium");

        let anonymous = build_upstream_headers(&ctx(), &route(false), &HeaderMap::new());
        assert!(anonymous.get("x-user-id").is_none());
    }

    #[test]
    fn preserve_host_keeps_the_inbound_host() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("gw.example.com"));
        let headers = build_upstream_headers(&ctx(), &route(true), &inbound);
        assert_eq!(headers[HOST], "gw.example.com");
    }
}
