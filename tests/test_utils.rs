// ============================================================================
// Integration Test Utilities
// ============================================================================
//
// Spawns the gateway and stub upstream services on ephemeral ports so the
// suite can drive real HTTP through the whole pipeline. The gateway under
// test runs against the in-process counter store; Redis is not required.
//
// ============================================================================

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router};
use serde_json::json;

use edge_gateway::config::{Config, RouteDefinition, TierConfig};
use edge_gateway::store::MemoryStore;
use edge_gateway::{build_router, AppState};

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Boot a gateway with the given config on an ephemeral port, backed by an
/// in-process counter store.
pub async fn spawn_gateway(config: Config) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::build(config, store.clone()).expect("failed to build gateway state");
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway { addr, state, store }
}

/// Serve an arbitrary axum router on an ephemeral port.
pub async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind upstream listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Upstream that reflects method, path, query and headers back as JSON.
pub fn echo_upstream() -> Router {
    Router::new().fallback(|request: Request| async move {
        let headers: HashMap<String, String> = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        Json(json!({
            "method": request.method().as_str(),
            "path": request.uri().path(),
            "query": request.uri().query(),
            "headers": headers,
        }))
    })
}

/// Upstream that always answers with one status code.
pub fn status_upstream(status: u16) -> Router {
    let status = StatusCode::from_u16(status).unwrap();
    Router::new().fallback(move || async move { (status, "upstream says no") })
}

/// Upstream that counts attempts and fails with 500 for the first
/// `failures` of them.
pub fn flaky_upstream(failures: usize, attempts: Arc<AtomicUsize>) -> Router {
    Router::new().fallback(move || {
        let attempts = attempts.clone();
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < failures {
                (StatusCode::INTERNAL_SERVER_ERROR, "still warming up").into_response()
            } else {
                (StatusCode::OK, "recovered").into_response()
            }
        }
    })
}

/// A route definition with the common test defaults.
pub fn route(path: &str, target: &str, methods: &[&str]) -> RouteDefinition {
    RouteDefinition {
        path: path.into(),
        target: target.into(),
        timeout_ms: Some(2_000),
        retries: Some(0),
        auth_required: None,
        rate_limit_tier: None,
        methods: methods.iter().map(|m| m.to_string()).collect(),
        strip_path: None,
        preserve_host: None,
        change_origin: None,
        required_roles: vec![],
        required_permissions: vec![],
    }
}

/// Base gateway config for tests: development mode, generous default
/// limits, plus a deliberately tiny `test-small` tier.
pub fn base_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.tiers.insert(
        "test-small".to_string(),
        TierConfig {
            requests: 3,
            window_ms: 60_000,
        },
    );
    config
}

/// An address nothing listens on, for connection-refused scenarios.
pub async fn closed_port_target() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
