//! RPC method handlers.
//!
//! Thin adapters: parse params, run the pre-flight policies, call the
//! guarded executor or introspection helpers, shape the JSON result.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::executor::QueryOptions;
use crate::error::{FailureKind, GatewayError};
use crate::introspect;
use crate::rpc::DispatchError;
use crate::safety::PolicyViolation;
use crate::AppContext;

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, DispatchError> {
    serde_json::from_value(params).map_err(|e| DispatchError::InvalidParams(e.to_string()))
}

fn policy_error(violation: PolicyViolation) -> DispatchError {
    DispatchError::Gateway(GatewayError::new(
        FailureKind::PermissionDenied,
        violation.to_string(),
        Duration::ZERO,
    ))
}

// ─── daemon.ping ─────────────────────────────────────────────────────────────

pub async fn ping(_params: Value, _ctx: &AppContext) -> Result<Value, DispatchError> {
    Ok(json!({ "pong": true, "version": env!("CARGO_PKG_VERSION") }))
}

// ─── db.query ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct QueryParams {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
    timeout_ms: Option<u64>,
    max_rows: Option<usize>,
}

pub async fn query(params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    let p: QueryParams = parse(params)?;
    ctx.policy.check(&p.sql).map_err(policy_error)?;
    let sql = ctx.policy.inject_limit(&p.sql);

    let opts = QueryOptions {
        timeout_ms: p.timeout_ms,
        max_rows: p.max_rows,
    };
    let outcome = ctx.executor.safe_query(&sql, &p.params, &opts).await?;
    Ok(serde_json::to_value(outcome).unwrap_or(Value::Null))
}

// ─── db.execute ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExecuteParams {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
    timeout_ms: Option<u64>,
}

pub async fn execute(params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    let p: ExecuteParams = parse(params)?;
    ctx.policy.check_write(&p.sql).map_err(policy_error)?;

    let opts = QueryOptions {
        timeout_ms: p.timeout_ms,
        max_rows: None,
    };
    let outcome = ctx.executor.safe_execute(&p.sql, &p.params, &opts).await?;
    Ok(serde_json::to_value(outcome).unwrap_or(Value::Null))
}

// ─── db.explain ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExplainParams {
    sql: String,
    #[serde(default = "default_analyze")]
    analyze: bool,
}

fn default_analyze() -> bool {
    true
}

pub async fn explain(params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    let p: ExplainParams = parse(params)?;
    ctx.policy.check(&p.sql).map_err(policy_error)?;

    // ANALYZE actually runs the statement, so it rides the guarded path like
    // any call; its failures are excluded from the breaker by the manager.
    let wrapped = if p.analyze {
        format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) {}", p.sql)
    } else {
        format!("EXPLAIN (FORMAT JSON) {}", p.sql)
    };

    let outcome = ctx
        .executor
        .safe_query(&wrapped, &[], &QueryOptions::default())
        .await?;
    Ok(json!({
        "plan": outcome.rows,
        "analyzed": p.analyze,
        "duration_ms": outcome.duration_ms,
    }))
}

// ─── db.introspect ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct IntrospectParams {
    #[serde(default = "default_kind")]
    kind: String,
    table: Option<String>,
}

fn default_kind() -> String {
    "tables".to_string()
}

pub async fn introspect(params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    let p: IntrospectParams = parse(params)?;
    match p.kind.as_str() {
        "schemas" => Ok(introspect::list_schemas(&ctx.executor).await?),
        "tables" => Ok(introspect::list_tables(&ctx.executor).await?),
        "describe" => {
            let table = p.table.ok_or_else(|| {
                DispatchError::InvalidParams("'describe' requires a 'table'".to_string())
            })?;
            Ok(introspect::describe_table(&ctx.executor, &table).await?)
        }
        other => Err(DispatchError::InvalidParams(format!(
            "unknown introspect kind '{other}' (expected schemas|tables|describe)"
        ))),
    }
}

// ─── db.stats ────────────────────────────────────────────────────────────────

pub async fn stats(_params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    Ok(introspect::database_stats(&ctx.executor).await?)
}

// ─── db.health ───────────────────────────────────────────────────────────────

/// The gateway's own health snapshot: guard stats plus pool occupancy and
/// the configuration echo. This never touches the database, so it works
/// while the circuit is open.
pub async fn health(_params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    let guard = ctx.guard.stats().await;
    let pool = ctx.executor.pool_stats();

    let mut snapshot = serde_json::to_value(&guard).unwrap_or_else(|_| json!({}));
    if let Some(object) = snapshot.as_object_mut() {
        object.insert(
            "pool".to_string(),
            serde_json::to_value(&pool).unwrap_or(Value::Null),
        );
        object.insert("config".to_string(), ctx.config.echo());
        object.insert("uptime_secs".to_string(), json!(ctx.guard.uptime_secs()));
    }
    Ok(snapshot)
}
