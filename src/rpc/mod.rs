// SPDX-License-Identifier: MIT
//! Line-oriented stdio JSON-RPC surface.
//!
//! The gateway speaks JSON-RPC 2.0, one object per line, over stdin/stdout:
//! the transport a conversational agent host drives. Requests are dispatched
//! concurrently (bounded in practice by the connection pool); responses are
//! funneled through a single writer task so output lines never interleave.
//!
//! Gateway failures map to JSON-RPC errors whose `data` field carries the
//! stable failure envelope `{type, message, duration_ms, retryable,
//! suggestion}` unchanged.

pub mod handlers;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, GatewayError};
use crate::AppContext;

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ─── Error codes ─────────────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

// Application range: one code per failure kind so clients can switch on the
// code alone; `error.data.type` carries the same information.
const TIMEOUT: i32 = -32001;
const CONNECTION_FAILED: i32 = -32002;
const POOL_EXHAUSTED: i32 = -32003;
const CIRCUIT_OPEN: i32 = -32004;
const QUERY_ERROR: i32 = -32005;
const PERMISSION_DENIED: i32 = -32006;
const CANCELLED: i32 = -32007;

fn failure_code(kind: FailureKind) -> i32 {
    match kind {
        FailureKind::Timeout => TIMEOUT,
        FailureKind::ConnectionFailed => CONNECTION_FAILED,
        FailureKind::PoolExhausted => POOL_EXHAUSTED,
        FailureKind::CircuitOpen => CIRCUIT_OPEN,
        FailureKind::QueryError => QUERY_ERROR,
        FailureKind::PermissionDenied => PERMISSION_DENIED,
        FailureKind::Cancelled => CANCELLED,
    }
}

/// Dispatch-level failure: either a transport problem or a classified
/// gateway error.
#[derive(Debug)]
pub enum DispatchError {
    InvalidParams(String),
    MethodNotFound(String),
    Gateway(GatewayError),
}

impl From<GatewayError> for DispatchError {
    fn from(err: GatewayError) -> Self {
        DispatchError::Gateway(err)
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Serve JSON-RPC over stdin/stdout until EOF or a shutdown signal.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    info!("gateway serving on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Single writer: responses from concurrent request tasks are serialized
    // onto stdout here.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!(err = %e, "stdout write failed");
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!(err = %e, "stdout flush failed");
                break;
            }
        }
    });

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received; cancelling in-flight calls");
                let _ = ctx.shutdown.send(true);
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let ctx = ctx.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            let response = dispatch_text(&text, &ctx).await;
                            let _ = out_tx.send(response).await;
                        });
                    }
                    Ok(None) => {
                        info!("stdin closed; shutting down");
                        let _ = ctx.shutdown.send(true);
                        break;
                    }
                    Err(e) => {
                        warn!(err = %e, "stdin read error");
                        let _ = ctx.shutdown.send(true);
                        break;
                    }
                }
            }
        }
    }

    // Let in-flight tasks flush their (cancelled) responses, then stop the
    // writer by closing the channel.
    drop(out_tx);
    let _ = writer.await;

    info!("stdio server stopped");
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix: SIGTERM or Ctrl-C. Elsewhere: Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(err = %e, "failed to register SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// Parse one request line and produce the response line.
///
/// Public so embedders and tests can drive the dispatch table without a
/// stdio pipe.
pub async fn dispatch_text(text: &str, ctx: &AppContext) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return error_response(Value::Null, PARSE_ERROR, "Parse error", None);
        }
    };

    if req.jsonrpc != "2.0" {
        return error_response(
            req.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
            None,
        );
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    debug!(method = %req.method, "rpc dispatch");

    match dispatch(&req.method, params, ctx).await {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(DispatchError::MethodNotFound(method)) => error_response(
            id,
            METHOD_NOT_FOUND,
            &format!("Method not found: {method}"),
            None,
        ),
        Err(DispatchError::InvalidParams(msg)) => {
            error_response(id, INVALID_PARAMS, &format!("Invalid params: {msg}"), None)
        }
        Err(DispatchError::Gateway(err)) => {
            debug!(kind = %err.kind, err = %err, "call failed");
            error_response(
                id,
                failure_code(err.kind),
                &err.message,
                Some(err.to_wire()),
            )
        }
    }
}

async fn dispatch(method: &str, params: Value, ctx: &AppContext) -> Result<Value, DispatchError> {
    match method {
        "daemon.ping" => handlers::ping(params, ctx).await,
        "db.query" => handlers::query(params, ctx).await,
        "db.execute" => handlers::execute(params, ctx).await,
        "db.explain" => handlers::explain(params, ctx).await,
        "db.introspect" => handlers::introspect(params, ctx).await,
        "db.stats" => handlers::stats(params, ctx).await,
        "db.health" => handlers::health(params, ctx).await,
        _ => Err(DispatchError::MethodNotFound(method.to_string())),
    }
}

fn error_response(id: Value, code: i32, message: &str, data: Option<Value>) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
            data,
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}
