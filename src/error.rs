// SPDX-License-Identifier: MIT
//! Failure taxonomy for guarded database calls.
//!
//! Every failure inside the gateway is classified into a closed set of kinds
//! before it reaches the caller. A raw driver error never crosses the RPC
//! boundary: it is wrapped with a kind, the elapsed wall duration, a
//! retryability flag, and a short actionable suggestion, so the calling agent
//! can decide whether to retry, rephrase, or give up.

use std::time::Duration;

use serde_json::{json, Value};

/// Closed set of failure classifications.
///
/// The seven variants are a stable wire contract; consumers match on the
/// snake_case `type` string and must never see anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The planned deadline elapsed during statement execution.
    Timeout,
    /// Could not obtain a live connection within the connect deadline.
    ConnectionFailed,
    /// No connection slot became available before the connect deadline.
    PoolExhausted,
    /// The circuit breaker refused the call; it never reached the database.
    CircuitOpen,
    /// The backend returned a statement-level error (syntax, constraint).
    QueryError,
    /// Pre-flight safety rejection or a backend authorization error.
    PermissionDenied,
    /// Outer cancellation observed before completion.
    Cancelled,
}

impl FailureKind {
    /// Whether retrying the same call can reasonably succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::ConnectionFailed
                | FailureKind::PoolExhausted
                | FailureKind::CircuitOpen
        )
    }

    /// Short actionable hint surfaced alongside the error message.
    pub fn suggestion(self) -> &'static str {
        match self {
            FailureKind::Timeout => {
                "Narrow the query (add WHERE or LIMIT) or pass a higher timeout_ms override"
            }
            FailureKind::ConnectionFailed => {
                "Check that the database is reachable and credentials are valid, then retry"
            }
            FailureKind::PoolExhausted => {
                "All connection slots are busy; retry shortly or reduce concurrent calls"
            }
            FailureKind::CircuitOpen => {
                "The database is failing repeatedly; wait for the retry window before calling again"
            }
            FailureKind::QueryError => {
                "Fix the SQL statement; the database rejected it as written"
            }
            FailureKind::PermissionDenied => {
                "This statement is not permitted through the gateway; rephrase without the blocked construct"
            }
            FailureKind::Cancelled => "The call was cancelled before completion; do not retry",
        }
    }

    /// The stable snake_case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionFailed => "connection_failed",
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::QueryError => "query_error",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified gateway failure.
///
/// Carries the kind, a human-readable message, the wall time elapsed inside
/// the gateway before the failure surfaced, and the underlying driver error
/// where one exists.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: FailureKind,
    pub message: String,
    pub duration: Duration,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GatewayError {
    pub fn new(kind: FailureKind, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind,
            message: message.into(),
            duration,
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// The stable failure envelope:
    /// `{type, message, duration_ms, retryable, suggestion}`.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "message": self.message,
            "duration_ms": self.duration.as_millis() as u64,
            "retryable": self.kind.retryable(),
            "suggestion": self.kind.suggestion(),
        })
    }
}
