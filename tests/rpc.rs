//! Dispatch-level tests for the stdio JSON-RPC surface.
//!
//! `dispatch_text` is driven directly, the same way the serve loop drives
//! it, with a context wired to an unreachable database.

use std::sync::Arc;
use std::time::Duration;

use pgward::config::GatewayConfig;
use pgward::rpc::dispatch_text;
use pgward::{db, AppContext};
use serde_json::{json, Value};

fn test_context() -> Arc<AppContext> {
    let mut config = GatewayConfig::default();
    config.database.host = "127.0.0.1".to_string();
    config.database.port = 1;
    config.timeouts.connect = Duration::from_millis(300);
    config.safety.blacklist_tables = vec!["credentials".to_string()];
    let config = Arc::new(config);
    let pool = db::connect(&config).expect("lazy pool construction");
    AppContext::new(config, pool)
}

async fn call(ctx: &AppContext, request: Value) -> Value {
    let response = dispatch_text(&request.to_string(), ctx).await;
    serde_json::from_str(&response).expect("response is valid JSON")
}

#[tokio::test]
async fn garbage_input_yields_parse_error() {
    let ctx = test_context();
    let response = dispatch_text("this is not json", &ctx).await;
    let parsed: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["error"]["code"], -32700);
    assert_eq!(parsed["id"], Value::Null);
}

#[tokio::test]
async fn wrong_jsonrpc_version_is_invalid_request() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({"jsonrpc": "1.0", "id": 1, "method": "daemon.ping"}),
    )
    .await;
    assert_eq!(parsed["error"]["code"], -32600);
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({"jsonrpc": "2.0", "id": 7, "method": "db.nonsense"}),
    )
    .await;
    assert_eq!(parsed["error"]["code"], -32601);
    assert_eq!(parsed["id"], 7);
}

#[tokio::test]
async fn ping_answers_with_version() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({"jsonrpc": "2.0", "id": 1, "method": "daemon.ping"}),
    )
    .await;
    assert_eq!(parsed["result"]["pong"], true);
    assert!(parsed["result"]["version"].is_string());
}

#[tokio::test]
async fn health_snapshot_works_without_a_database() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({"jsonrpc": "2.0", "id": 2, "method": "db.health"}),
    )
    .await;
    let result = &parsed["result"];

    assert_eq!(result["status"], "healthy");
    assert_eq!(result["circuit"], "closed");
    assert!(result["circuit_opens_in_ms"].is_null());
    assert!(result["pool"]["total"].is_number());
    assert!(result["pool"]["idle"].is_number());
    assert!(result["pool"]["waiting"].is_number());
    assert_eq!(result["config"]["base_timeout_ms"], 10_000);
    assert_eq!(result["uptime_percent"], 100.0);
}

#[tokio::test]
async fn denylisted_sql_is_rejected_before_the_core() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "db.query",
            "params": {"sql": "DROP TABLE users"}
        }),
    )
    .await;

    let error = &parsed["error"];
    assert_eq!(error["data"]["type"], "permission_denied");
    assert_eq!(error["data"]["retryable"], false);
    // Rejected pre-flight: the call never reached the database, so no time
    // was spent inside the core.
    assert_eq!(error["data"]["duration_ms"], 0);
}

#[tokio::test]
async fn blacklisted_table_is_rejected() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({
            "jsonrpc": "2.0", "id": 4, "method": "db.query",
            "params": {"sql": "SELECT * FROM credentials"}
        }),
    )
    .await;
    assert_eq!(parsed["error"]["data"]["type"], "permission_denied");
    assert!(parsed["error"]["message"]
        .as_str()
        .unwrap()
        .contains("blacklisted"));
}

#[tokio::test]
async fn update_without_where_is_rejected() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({
            "jsonrpc": "2.0", "id": 5, "method": "db.execute",
            "params": {"sql": "UPDATE users SET active = false"}
        }),
    )
    .await;
    assert_eq!(parsed["error"]["data"]["type"], "permission_denied");
    assert!(parsed["error"]["message"]
        .as_str()
        .unwrap()
        .contains("WHERE"));
}

#[tokio::test]
async fn failure_envelope_is_complete_against_a_dead_database() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({
            "jsonrpc": "2.0", "id": 6, "method": "db.query",
            "params": {"sql": "SELECT 1"}
        }),
    )
    .await;

    let data = &parsed["error"]["data"];
    assert_eq!(data["type"], "connection_failed");
    assert_eq!(data["retryable"], true);
    assert!(data["duration_ms"].is_number());
    assert!(!data["suggestion"].as_str().unwrap().is_empty());
    assert!(!data["message"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn missing_params_are_invalid_params() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({"jsonrpc": "2.0", "id": 8, "method": "db.query", "params": {}}),
    )
    .await;
    assert_eq!(parsed["error"]["code"], -32602);
}

#[tokio::test]
async fn introspect_describe_requires_a_table() {
    let ctx = test_context();
    let parsed = call(
        &ctx,
        json!({
            "jsonrpc": "2.0", "id": 9, "method": "db.introspect",
            "params": {"kind": "describe"}
        }),
    )
    .await;
    assert_eq!(parsed["error"]["code"], -32602);
}
