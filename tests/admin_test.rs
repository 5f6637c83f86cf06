// ============================================================================
// Admin Surface & Health Probe Tests
// ============================================================================

mod test_utils;

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Router;
use serde_json::{json, Value};
use test_utils::{base_config, echo_upstream, route, spawn_gateway, spawn_upstream};

#[tokio::test]
async fn routes_can_be_added_and_removed_at_runtime() {
    let upstream = spawn_upstream(echo_upstream()).await;
    let gateway = spawn_gateway(base_config()).await;
    let client = reqwest::Client::new();

    // nothing matches yet
    let response = client.get(gateway.url("/api/orders")).send().await.unwrap();
    assert_eq!(response.status(), 404);

    // add a route through the admin surface
    let response = client
        .post(gateway.url("/admin/routes"))
        .json(&json!({
            "path": "/api/orders",
            "target": format!("http://{}", upstream),
            "methods": ["GET"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client.get(gateway.url("/api/orders")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let listing: Value = client
        .get(gateway.url("/admin/routes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["routes"][0]["path"], "/api/orders");

    // and remove it again
    let removed: Value = client
        .delete(gateway.url("/admin/routes"))
        .query(&[("path", "/api/orders")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(removed["removed"], 1);

    let response = client.get(gateway.url("/api/orders")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn invalid_route_definitions_are_rejected() {
    let gateway = spawn_gateway(base_config()).await;

    let response = reqwest::Client::new()
        .post(gateway.url("/admin/routes"))
        .json(&json!({
            "path": "no-leading-slash",
            "target": "http://u",
            "methods": ["GET"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn metrics_count_requests_and_reset_swaps_cleanly() {
    let upstream = spawn_upstream(echo_upstream()).await;
    let mut config = base_config();
    config
        .routes
        .push(route("/api/echo", &format!("http://{}", upstream), &["GET"]));
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    client.get(gateway.url("/api/echo")).send().await.unwrap();
    client.get(gateway.url("/api/echo")).send().await.unwrap();
    client.get(gateway.url("/api/miss")).send().await.unwrap();

    let summary: Value = client
        .get(gateway.url("/admin/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["totalRequests"], 3);
    assert_eq!(summary["totalErrors"], 1);

    let dump: Value = client
        .get(gateway.url("/admin/metrics/dump"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dump["routes"]["/api/echo"]["count"], 2);
    assert_eq!(dump["routes"]["unmatched"]["count"], 1);

    client
        .post(gateway.url("/admin/metrics/reset"))
        .send()
        .await
        .unwrap();
    let summary: Value = client
        .get(gateway.url("/admin/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["totalRequests"], 0);
}

#[tokio::test]
async fn token_minting_works_in_development_only() {
    let gateway = spawn_gateway(base_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(gateway.url("/admin/token"))
        .json(&json!({ "subject": "test-user", "roles": ["admin"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(!body["token"].as_str().unwrap().is_empty());

    // production refuses
    let mut config = base_config();
    config.environment = edge_gateway::config::Environment::Production;
    let production_gateway = spawn_gateway(config).await;

    let response = client
        .post(production_gateway.url("/admin/token"))
        .json(&json!({ "subject": "test-user" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn health_probes_report_each_level() {
    let gateway = spawn_gateway(base_config()).await;
    let client = reqwest::Client::new();

    let response = client.get(gateway.url("/health/live")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let response = client.get(gateway.url("/health/ready")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let deep: Value = client
        .get(gateway.url("/health/deep"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deep["status"], "healthy");
    assert_eq!(deep["checks"]["filesystem"], "ok");
    assert_eq!(deep["checks"]["config"], "ok");
}

#[tokio::test]
async fn readiness_follows_the_store_and_the_shutdown_flag() {
    let gateway = spawn_gateway(base_config()).await;
    let client = reqwest::Client::new();

    // store down -> not ready
    gateway.store.set_unavailable(true);
    let response = client.get(gateway.url("/health/ready")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    gateway.store.set_unavailable(false);

    // shutdown flag -> not ready, regardless of the store
    gateway.state.ready.store(false, Ordering::SeqCst);
    let response = client.get(gateway.url("/health/ready")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "shutting_down");
}

#[tokio::test]
async fn in_flight_requests_finish_while_readiness_is_down() {
    // upstream that takes a while to answer
    let slow: Router = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        "slow but fine"
    });
    let upstream = spawn_upstream(slow).await;

    let mut config = base_config();
    config
        .routes
        .push(route("/api/slow", &format!("http://{}", upstream), &["GET"]));
    let gateway = spawn_gateway(config).await;

    let in_flight = tokio::spawn({
        let url = gateway.url("/api/slow");
        async move { reqwest::get(url).await.unwrap() }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    gateway.state.ready.store(false, Ordering::SeqCst);

    let ready = reqwest::get(gateway.url("/health/ready")).await.unwrap();
    assert_eq!(ready.status(), 503);

    // the request issued before the flag flipped still completes normally
    let response = in_flight.await.unwrap();
    assert_eq!(response.status(), 200);
}
