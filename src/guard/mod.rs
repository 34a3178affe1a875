// SPDX-License-Identifier: MIT
//! Guard manager: the single façade every database call traverses.
//!
//! Composes the circuit breaker, the health monitor, and the timeout planner.
//! Each component owns its state behind its own lock; the manager only reads
//! snapshots and routes signals, so the breaker and the monitor never share
//! mutable state with each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::circuit_breaker::{CircuitBreaker, CircuitDecision, CircuitState};
use crate::config::GatewayConfig;
use crate::health::{HealthLevel, HealthMonitor, Ping};
use crate::timeouts::{QueryShape, TimeoutPlan, TimeoutPlanner};

/// Stats snapshot served by the health tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GuardStats {
    pub status: HealthLevel,
    pub circuit: CircuitState,
    /// Remaining time until the open circuit admits a probe; null unless open.
    pub circuit_opens_in_ms: Option<u64>,
    /// Most recent probe latency.
    pub latency_ms: u64,
    /// 95th percentile of the rolling probe-latency sample.
    pub latency_p95_ms: u64,
    /// Failures currently inside the breaker window.
    pub recent_failures: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Share of executed calls that succeeded since startup.
    pub uptime_percent: f64,
}

/// Façade over the guard components.
pub struct GuardManager {
    circuit: CircuitBreaker,
    health: HealthMonitor,
    planner: TimeoutPlanner,
    started_at: Instant,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl GuardManager {
    pub fn new(config: &GatewayConfig, ping: Arc<dyn Ping>) -> Self {
        Self {
            circuit: CircuitBreaker::new(config.circuit.clone()),
            health: HealthMonitor::new(ping, &config.timeouts, config.health.clone()),
            planner: TimeoutPlanner::new(config.timeouts.base, config.adaptive.clone()),
            started_at: Instant::now(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Whether a call may proceed right now.
    pub async fn can_execute(&self) -> CircuitDecision {
        self.circuit.can_execute().await
    }

    /// Plan the statement deadline from query shape and current health.
    pub async fn get_timeout(&self, sql: &str, user_override_ms: Option<u64>) -> TimeoutPlan {
        let health = self.health.level().await;
        self.planner.plan(sql, health, user_override_ms)
    }

    /// Whether a query's failures are kept out of the breaker window.
    /// True only for EXPLAIN ANALYZE, which is treated as diagnostic.
    pub fn is_excluded(&self, sql: &str) -> bool {
        QueryShape::detect(sql).is_explain_analyze
    }

    /// Record a successful executed call.
    pub async fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.circuit.record_success().await;
    }

    /// Record a failed executed call. The query decides breaker exclusion.
    pub async fn record_failure(&self, sql: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.circuit.record_failure(self.is_excluded(sql)).await;
    }

    /// The health monitor, for scheduler startup and probing.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Assemble the stats snapshot from component snapshots.
    pub async fn stats(&self) -> GuardStats {
        let circuit = self.circuit.snapshot().await;
        let health = self.health.snapshot().await;
        let p95 = self.health.latency_p95().await;

        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let executed = successes + failures;
        let uptime_percent = if executed == 0 {
            100.0
        } else {
            (successes as f64 / executed as f64) * 100.0
        };

        GuardStats {
            status: health.level,
            circuit: circuit.state,
            circuit_opens_in_ms: circuit.retry_in.map(|d| d.as_millis() as u64),
            latency_ms: health
                .last_latency
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            latency_p95_ms: p95.as_millis() as u64,
            recent_failures: circuit.recent_failures,
            last_success: health.last_success,
            last_failure: health.last_failure,
            uptime_percent,
        }
    }

    /// Seconds since the manager was constructed.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for GuardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardManager")
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitSettings;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysOk;

    #[async_trait]
    impl Ping for AlwaysOk {
        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn manager() -> GuardManager {
        let mut config = GatewayConfig::default();
        config.circuit = CircuitSettings {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_millis(50),
            recovery_threshold: 2,
        };
        GuardManager::new(&config, Arc::new(AlwaysOk))
    }

    #[tokio::test]
    async fn explain_analyze_is_the_only_exclusion() {
        let m = manager();
        assert!(m.is_excluded("EXPLAIN ANALYZE SELECT * FROM t"));
        assert!(m.is_excluded("explain (analyze, buffers) select 1"));
        assert!(!m.is_excluded("EXPLAIN SELECT * FROM t"));
        assert!(!m.is_excluded("SELECT * FROM t"));
    }

    #[tokio::test]
    async fn excluded_failures_never_trip_the_breaker() {
        let m = manager();
        for _ in 0..10 {
            m.record_failure("EXPLAIN ANALYZE SELECT * FROM big").await;
        }
        assert!(m.can_execute().await.allowed);
        assert_eq!(m.stats().await.recent_failures, 0);
    }

    #[tokio::test]
    async fn failures_trip_and_stats_reflect_it() {
        let m = manager();
        for _ in 0..3 {
            m.record_failure("SELECT 1").await;
        }
        let decision = m.can_execute().await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().starts_with("Circuit open."));

        let stats = m.stats().await;
        assert_eq!(stats.circuit, CircuitState::Open);
        assert!(stats.circuit_opens_in_ms.is_some());
        assert_eq!(stats.recent_failures, 3);
        assert_eq!(stats.uptime_percent, 0.0);
    }

    #[tokio::test]
    async fn circuit_opens_in_is_null_unless_open() {
        let m = manager();
        let stats = m.stats().await;
        assert_eq!(stats.circuit, CircuitState::Closed);
        assert!(stats.circuit_opens_in_ms.is_none());
    }

    #[tokio::test]
    async fn uptime_percent_tracks_executed_calls() {
        let m = manager();
        assert_eq!(m.stats().await.uptime_percent, 100.0);
        m.record_success().await;
        m.record_success().await;
        m.record_success().await;
        m.record_failure("SELECT 1").await;
        assert_eq!(m.stats().await.uptime_percent, 75.0);
    }

    #[tokio::test]
    async fn timeout_plan_uses_current_health() {
        let m = manager();
        let plan = m.get_timeout("SELECT id FROM t", None).await;
        assert_eq!(plan.duration, Duration::from_millis(10_000));
        assert_eq!(plan.reason, "base timeout");
    }

    #[tokio::test]
    async fn recovery_after_open_duration() {
        let m = manager();
        for _ in 0..3 {
            m.record_failure("SELECT 1").await;
        }
        assert!(!m.can_execute().await.allowed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(m.can_execute().await.allowed);
        assert_eq!(m.stats().await.circuit, CircuitState::HalfOpen);

        m.record_success().await;
        m.record_success().await;
        assert_eq!(m.stats().await.circuit, CircuitState::Closed);
    }
}
