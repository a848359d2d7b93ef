mod common;

use chrono::Duration as ChronoDuration;
use common::{harness, topic_stats_body, Reply, ADMIN_URL};
use pulsarboard_core::{Aggregation, AggregationType, Clock, StatsRepository};
use pulsarboard_gateway::app::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

async fn serve(state: Arc<AppState>) -> Result<String, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.ok();
    });
    Ok(format!("http://{}", addr))
}

#[tokio::test]
async fn reads_are_wrapped_in_staleness_envelope() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.transport
        .respond("/admin/v2/tenants", Reply::json(json!(["acme", "globex"])));
    h.transport.respond(
        "/admin/v2/persistent/acme/orders/created/stats",
        Reply::json(topic_stats_body(25, 4.0)),
    );
    let base = serve(h.state.clone()).await?;
    let http = reqwest::Client::new();

    let resp = http.get(format!("{}/api/v1/tenants", base)).send().await?;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await?;
    assert_eq!(
        body,
        json!({ "value": ["acme", "globex"], "stale": false, "age_seconds": 0, "source": "live" })
    );

    let resp = http
        .get(format!("{}/api/v1/topics/acme/orders/created/stats", base))
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await?;
    assert_eq!(body["value"]["backlog_size"], 25.0);
    assert_eq!(body["value"]["subscriptions"][0]["name"], "audit");
    assert_eq!(body["stale"], false);
    Ok(())
}

/// Test: upstream outage without any retained value
///
/// Purpose
/// - The dashboard gets a 503 it can back off from, not a hang or a 500
///
/// Flow
/// - Nothing cached, nothing persisted, the admin API refuses connections
///
/// Expected
/// - 503 with a Retry-After header and a machine-readable error code
#[tokio::test]
async fn outage_without_fallback_is_503_with_retry_after() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.transport.respond("/admin/v2/tenants", Reply::Refused);
    let base = serve(h.state.clone()).await?;

    let resp = reqwest::get(format!("{}/api/v1/tenants", base)).await?;
    assert_eq!(resp.status(), 503);
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing Retry-After")?
        .to_string();
    assert_eq!(retry_after, "5");
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], "no_fallback_available");
    assert_eq!(body["retry_after_seconds"], 5);
    Ok(())
}

#[tokio::test]
async fn upstream_not_found_passes_through() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.transport.respond(
        "/admin/v2/persistent/acme/orders/ghost/stats",
        Reply::Status(404, r#"{"reason":"Topic not found"}"#.into()),
    );
    h.transport.respond(
        "/admin/v2/persistent/acme/orders/ghost/partitioned-stats",
        Reply::Status(404, r#"{"reason":"Topic not found"}"#.into()),
    );
    let base = serve(h.state.clone()).await?;

    let resp = reqwest::get(format!("{}/api/v1/topics/acme/orders/ghost/stats", base)).await?;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], "client_error");
    Ok(())
}

#[tokio::test]
async fn aggregations_report_age_and_staleness() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let now = h.clock.now();
    h.repository
        .upsert_aggregation(&Aggregation {
            agg_type: AggregationType::Tenant,
            key: "acme".into(),
            topic_count: 3,
            total_backlog: 120,
            total_msg_rate_in: 9.0,
            total_msg_rate_out: 4.5,
            total_storage_size: 2048,
            computed_at: now - ChronoDuration::seconds(30),
        })
        .await?;
    h.repository
        .upsert_aggregation(&Aggregation {
            agg_type: AggregationType::Namespace,
            key: "acme/orders".into(),
            topic_count: 0,
            total_backlog: 0,
            total_msg_rate_in: 0.0,
            total_msg_rate_out: 0.0,
            total_storage_size: 0,
            computed_at: now - ChronoDuration::seconds(200),
        })
        .await?;
    let base = serve(h.state.clone()).await?;

    let body: Value = reqwest::get(format!("{}/api/v1/aggregations/tenants/acme", base))
        .await?
        .json()
        .await?;
    assert_eq!(body["value"]["total_backlog"], 120);
    assert_eq!(body["age_seconds"], 30);
    assert_eq!(body["stale"], false);
    assert_eq!(body["source"], "repository");

    // two missed 60s cycles
    let body: Value = reqwest::get(format!("{}/api/v1/aggregations/namespaces/acme/orders", base))
        .await?
        .json()
        .await?;
    assert_eq!(body["value"]["topic_count"], 0);
    assert_eq!(body["stale"], true);
    assert_eq!(body["age_seconds"], 200);

    let body: Value = reqwest::get(format!("{}/api/v1/aggregations/tenants", base))
        .await?
        .json()
        .await?;
    assert_eq!(body["value"].as_array().map(Vec::len), Some(1));

    let resp = reqwest::get(format!("{}/api/v1/aggregations/tenants/globex", base)).await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}

#[tokio::test]
async fn history_rejects_inverted_range() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let base = serve(h.state.clone()).await?;

    let resp = reqwest::get(format!(
        "{}/api/v1/topics/acme/orders/created/history?from=2024-05-10T12:00:00Z&to=2024-05-10T11:00:00Z",
        base
    ))
    .await?;
    assert_eq!(resp.status(), 400);

    let resp = reqwest::get(format!("{}/api/v1/topics/acme/orders/created/history", base)).await?;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await?;
    assert_eq!(body["value"], json!([]));
    Ok(())
}

/// Test: environment switch over HTTP
///
/// Purpose
/// - PUT /api/v1/environment swaps the cluster, never echoes credentials and
///   drops everything cached from the previous cluster
///
/// Flow
/// - Cache the tenant list from the first cluster
/// - Switch to a second admin URL with token auth
/// - Read tenants again
///
/// Expected
/// - The view shows the new name, URL and auth mode, no token reference
/// - The next read goes to the new target instead of the cache
#[tokio::test]
async fn environment_switch_clears_cache() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.transport.respond("/admin/v2/tenants", Reply::json(json!(["acme"])));
    let base = serve(h.state.clone()).await?;
    let http = reqwest::Client::new();

    http.get(format!("{}/api/v1/tenants", base)).send().await?;

    let resp = http
        .put(format!("{}/api/v1/environment", base))
        .json(&json!({
            "name": "staging",
            "admin_url": "http://staging-admin:8080/",
            "auth": { "mode": "token", "token_env": "STAGING_PULSAR_TOKEN" }
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let view: Value = resp.json().await?;
    assert_eq!(view["name"], "staging");
    assert_eq!(view["admin_url"], "http://staging-admin:8080");
    assert_eq!(view["auth_mode"], "token");
    assert!(!view.to_string().contains("STAGING_PULSAR_TOKEN"));

    let body: Value = http
        .get(format!("{}/api/v1/tenants", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["source"], "live");
    let targets: Vec<String> = h
        .transport
        .calls_to("/admin/v2/tenants")
        .into_iter()
        .map(|c| c.target)
        .collect();
    assert_eq!(targets, vec![ADMIN_URL.to_string(), "http://staging-admin:8080".to_string()]);

    let resp = http
        .put(format!("{}/api/v1/environment", base))
        .json(&json!({ "admin_url": "ftp://nowhere" }))
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    Ok(())
}

#[tokio::test]
async fn tenant_creation_defaults_to_all_clusters() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.transport
        .respond("/admin/v2/clusters", Reply::json(json!(["standalone"])));
    h.transport.respond("/admin/v2/tenants/acme", Reply::ok());
    h.transport.respond("/admin/v2/tenants", Reply::json(json!(["acme"])));
    let base = serve(h.state.clone()).await?;
    let http = reqwest::Client::new();

    let resp = http.put(format!("{}/api/v1/tenants/acme", base)).send().await?;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(h.transport.calls_to("/admin/v2/clusters").len(), 1);

    let resp = http.put(format!("{}/api/v1/tenants/bad%20name", base)).send().await?;
    assert_eq!(resp.status(), 400);
    Ok(())
}

#[tokio::test]
async fn health_reports_circuits() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.transport.respond("/admin/v2/tenants", Reply::json(json!([])));
    h.state.admin.list_tenants().await?;
    let base = serve(h.state.clone()).await?;

    let body: Value = reqwest::get(format!("{}/api/v1/health", base)).await?.json().await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
    assert_eq!(body["stats_store_reachable"], true);
    assert_eq!(body["circuits"][0]["target"], ADMIN_URL);
    assert_eq!(body["circuits"][0]["status"], "closed");
    Ok(())
}
