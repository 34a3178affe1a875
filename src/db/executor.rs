// SPDX-License-Identifier: MIT
//! Guarded statement execution.
//!
//! Every call traverses the same sequence: breaker permission, deadline
//! planning, connection acquisition under the connect deadline, execution
//! under the planned deadline, outcome recording. Each wait is bounded by an
//! explicit deadline, so a call's wall time never exceeds
//! connect deadline + planned deadline (plus scheduling slack). A shutdown
//! signal observed at any suspension point surfaces as `cancelled`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::rows::{bind_params, field_descs, row_to_json, FieldDesc};
use crate::error::{FailureKind, GatewayError};
use crate::guard::GuardManager;

/// Per-call options from the tool layer.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Caller-supplied deadline override, clamped by the planner.
    pub timeout_ms: Option<u64>,
    /// Cap on returned rows, applied after fetch.
    pub max_rows: Option<usize>,
}

/// Result of a guarded read.
#[derive(Debug, serde::Serialize)]
pub struct QueryOutcome {
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub fields: Vec<FieldDesc>,
    pub duration_ms: u64,
}

/// Result of a guarded write.
#[derive(Debug, serde::Serialize)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub duration_ms: u64,
}

/// Pool occupancy for the health snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub total: u32,
    pub idle: usize,
    pub waiting: u64,
}

/// Executes statements through the guard manager and the pool.
///
/// Cheaply cloneable; clones share the pool, the guard, and the shutdown
/// signal.
#[derive(Clone)]
pub struct Executor {
    pool: PgPool,
    guard: Arc<GuardManager>,
    connect_deadline: Duration,
    /// Callers currently inside connection acquisition.
    acquiring: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        guard: Arc<GuardManager>,
        connect_deadline: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            guard,
            connect_deadline,
            acquiring: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn guard(&self) -> &Arc<GuardManager> {
        &self.guard
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            total: self.pool.size(),
            idle: self.pool.num_idle(),
            waiting: self.acquiring.load(Ordering::Relaxed),
        }
    }

    /// Run a read statement through the guard; rows come back as JSON.
    pub async fn safe_query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<QueryOutcome, GatewayError> {
        let start = Instant::now();
        self.cancellable(start, self.run_query(sql, params, opts, start))
            .await
    }

    /// Run a write statement through the guard; returns the affected count.
    pub async fn safe_execute(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<ExecOutcome, GatewayError> {
        let start = Instant::now();
        self.cancellable(start, self.run_execute(sql, params, opts, start))
            .await
    }

    // ─── Guarded sequence ────────────────────────────────────────────────────

    async fn run_query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
        start: Instant,
    ) -> Result<QueryOutcome, GatewayError> {
        let plan = self.admit(sql, opts).await?;
        let mut conn = self.acquire(sql, start).await?;

        let fetched = tokio::time::timeout(
            plan,
            bind_params(sqlx::query(sql), params).fetch_all(&mut *conn),
        )
        .await;

        match fetched {
            Err(_) => Err(self.fail_timeout(sql, conn, plan, start).await),
            Ok(Err(e)) => Err(self.fail_driver(sql, e, start).await),
            Ok(Ok(pg_rows)) => {
                self.guard.record_success().await;
                let fields = pg_rows.first().map(field_descs).unwrap_or_default();
                let mut rows: Vec<Value> = pg_rows.iter().map(row_to_json).collect();
                if let Some(cap) = opts.max_rows {
                    rows.truncate(cap);
                }
                Ok(QueryOutcome {
                    row_count: rows.len(),
                    rows,
                    fields,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn run_execute(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
        start: Instant,
    ) -> Result<ExecOutcome, GatewayError> {
        let plan = self.admit(sql, opts).await?;
        let mut conn = self.acquire(sql, start).await?;

        let executed = tokio::time::timeout(
            plan,
            bind_params(sqlx::query(sql), params).execute(&mut *conn),
        )
        .await;

        match executed {
            Err(_) => Err(self.fail_timeout(sql, conn, plan, start).await),
            Ok(Err(e)) => Err(self.fail_driver(sql, e, start).await),
            Ok(Ok(done)) => {
                self.guard.record_success().await;
                Ok(ExecOutcome {
                    rows_affected: done.rows_affected(),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Steps 1 and 2: breaker permission, then the planned deadline.
    async fn admit(&self, sql: &str, opts: &QueryOptions) -> Result<Duration, GatewayError> {
        let decision = self.guard.can_execute().await;
        if !decision.allowed {
            return Err(GatewayError::new(
                FailureKind::CircuitOpen,
                decision
                    .reason
                    .unwrap_or_else(|| "Circuit open".to_string()),
                Duration::ZERO,
            ));
        }
        let plan = self.guard.get_timeout(sql, opts.timeout_ms).await;
        debug!(
            deadline_ms = plan.duration.as_millis() as u64,
            reason = %plan.reason,
            "planned statement deadline"
        );
        Ok(plan.duration)
    }

    /// Step 3: acquire a pooled connection under the connect deadline.
    ///
    /// The pool's own `acquire_timeout` matches the connect deadline, with
    /// an outer race as a backstop. sqlx reports every deadline elapse as
    /// `PoolTimedOut`, which conflates an unreachable database with a
    /// saturated pool, so the two are separated here by occupancy: only
    /// when every slot is established and checked out is the failure
    /// `pool_exhausted`; otherwise no connection could be brought up in
    /// time and the failure is `connection_failed`.
    async fn acquire(
        &self,
        sql: &str,
        start: Instant,
    ) -> Result<PoolConnection<Postgres>, GatewayError> {
        self.acquiring.fetch_add(1, Ordering::Relaxed);
        let acquired =
            tokio::time::timeout(self.connect_deadline, self.pool.acquire()).await;
        self.acquiring.fetch_sub(1, Ordering::Relaxed);

        let err = match acquired {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => {
                if self.pool_saturated() {
                    GatewayError::new(
                        FailureKind::PoolExhausted,
                        format!(
                            "no connection slot became available within {}ms",
                            self.connect_deadline.as_millis()
                        ),
                        start.elapsed(),
                    )
                } else {
                    GatewayError::new(
                        FailureKind::ConnectionFailed,
                        format!(
                            "could not obtain a live connection within {}ms",
                            self.connect_deadline.as_millis()
                        ),
                        start.elapsed(),
                    )
                }
            }
            Ok(Err(e)) => GatewayError::new(
                FailureKind::ConnectionFailed,
                format!("could not obtain a live connection: {e}"),
                start.elapsed(),
            )
            .with_source(e),
        };
        self.guard.record_failure(sql).await;
        Err(err)
    }

    /// Every slot established and checked out: acquisition failed for lack
    /// of a free slot, not for lack of a reachable database.
    fn pool_saturated(&self) -> bool {
        self.pool.num_idle() == 0
            && self.pool.size() >= self.pool.options().get_max_connections()
    }

    /// Step 5, deadline branch: the statement outlived its planned deadline.
    ///
    /// The connection still has a query in flight, so it is detached from
    /// the pool and closed in the background instead of being returned.
    async fn fail_timeout(
        &self,
        sql: &str,
        conn: PoolConnection<Postgres>,
        plan: Duration,
        start: Instant,
    ) -> GatewayError {
        let raw = conn.detach();
        tokio::spawn(async move {
            let _ = raw.close().await;
        });
        warn!(
            deadline_ms = plan.as_millis() as u64,
            "statement exceeded its planned deadline"
        );
        self.guard.record_failure(sql).await;
        GatewayError::new(
            FailureKind::Timeout,
            format!(
                "query exceeded planned deadline of {}ms",
                plan.as_millis()
            ),
            start.elapsed(),
        )
    }

    /// Step 5, error branch: classify what the driver reported.
    async fn fail_driver(
        &self,
        sql: &str,
        error: sqlx::Error,
        start: Instant,
    ) -> GatewayError {
        self.guard.record_failure(sql).await;
        classify_driver_error(error, start.elapsed())
    }

    /// Race a guarded call against the shutdown signal.
    async fn cancellable<T>(
        &self,
        start: Instant,
        work: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(cancelled_error(start));
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => Err(cancelled_error(start)),
            result = work => result,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("connect_deadline", &self.connect_deadline)
            .finish()
    }
}

fn cancelled_error(start: Instant) -> GatewayError {
    GatewayError::new(
        FailureKind::Cancelled,
        "call cancelled by gateway shutdown",
        start.elapsed(),
    )
}

/// Map a driver error to the closed taxonomy.
///
/// SQLSTATE class 28 (authorization) and 42501 (insufficient privilege)
/// become `permission_denied`; transport-level failures become
/// `connection_failed`; everything else the backend reports is a
/// `query_error`.
fn classify_driver_error(error: sqlx::Error, elapsed: Duration) -> GatewayError {
    let (kind, message) = match &error {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code.starts_with("28") || code == "42501" {
                (
                    FailureKind::PermissionDenied,
                    format!("database rejected the call: {}", db.message()),
                )
            } else {
                (
                    FailureKind::QueryError,
                    format!("statement failed: {}", db.message()),
                )
            }
        }
        sqlx::Error::Io(e) => (
            FailureKind::ConnectionFailed,
            format!("connection lost during execution: {e}"),
        ),
        sqlx::Error::Tls(e) => (
            FailureKind::ConnectionFailed,
            format!("TLS failure: {e}"),
        ),
        sqlx::Error::Protocol(e) => (
            FailureKind::ConnectionFailed,
            format!("protocol error: {e}"),
        ),
        sqlx::Error::PoolClosed => (
            FailureKind::ConnectionFailed,
            "connection pool is closed".to_string(),
        ),
        sqlx::Error::PoolTimedOut => (
            FailureKind::PoolExhausted,
            "connection pool exhausted".to_string(),
        ),
        other => (
            FailureKind::QueryError,
            format!("statement failed: {other}"),
        ),
    };
    GatewayError::new(kind, message, elapsed).with_source(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_28xxx_is_permission_denied() {
        // No portable way to fabricate a sqlx database error without a live
        // server; classification of the transport variants is covered here
        // and the SQLSTATE branch is exercised by the integration tests.
        let err = classify_driver_error(sqlx::Error::PoolClosed, Duration::from_millis(5));
        assert_eq!(err.kind, FailureKind::ConnectionFailed);

        let err = classify_driver_error(sqlx::Error::PoolTimedOut, Duration::from_millis(5));
        assert_eq!(err.kind, FailureKind::PoolExhausted);

        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        let err = classify_driver_error(io, Duration::from_millis(5));
        assert_eq!(err.kind, FailureKind::ConnectionFailed);
        assert!(err.source.is_some());
    }

    #[test]
    fn row_not_found_is_a_query_error() {
        let err = classify_driver_error(sqlx::Error::RowNotFound, Duration::from_millis(1));
        assert_eq!(err.kind, FailureKind::QueryError);
    }
}
