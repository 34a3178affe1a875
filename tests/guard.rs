//! Guard manager behavior: circuit trip, recovery, exclusion, stats.
//!
//! No database needed; the manager only routes signals between its
//! components.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pgward::circuit_breaker::CircuitState;
use pgward::config::{CircuitSettings, GatewayConfig};
use pgward::guard::GuardManager;
use pgward::health::Ping;

struct NoopPing;

#[async_trait]
impl Ping for NoopPing {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn manager_with_circuit(circuit: CircuitSettings) -> GuardManager {
    let mut config = GatewayConfig::default();
    config.circuit = circuit;
    GuardManager::new(&config, Arc::new(NoopPing))
}

fn fast_circuit() -> CircuitSettings {
    CircuitSettings {
        failure_threshold: 5,
        failure_window: Duration::from_secs(60),
        open_duration: Duration::from_millis(80),
        recovery_threshold: 2,
    }
}

#[tokio::test]
async fn five_failures_trip_the_circuit() {
    let manager = manager_with_circuit(fast_circuit());

    for _ in 0..4 {
        manager.record_failure("SELECT 1").await;
        assert!(manager.can_execute().await.allowed, "below threshold");
    }
    manager.record_failure("SELECT 1").await;

    let decision = manager.can_execute().await;
    assert!(!decision.allowed);
    assert!(decision
        .reason
        .unwrap()
        .starts_with("Circuit open. Retry in"));
}

#[tokio::test]
async fn rejections_while_open_are_immediate() {
    let manager = manager_with_circuit(fast_circuit());
    for _ in 0..5 {
        manager.record_failure("SELECT 1").await;
    }

    let start = Instant::now();
    for _ in 0..20 {
        assert!(!manager.can_execute().await.allowed);
    }
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "open-circuit rejection must not block"
    );
}

#[tokio::test]
async fn probe_success_then_success_closes() {
    let manager = manager_with_circuit(fast_circuit());
    for _ in 0..5 {
        manager.record_failure("SELECT 1").await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The first permitted call is the probe.
    assert!(manager.can_execute().await.allowed);
    assert_eq!(manager.stats().await.circuit, CircuitState::HalfOpen);

    manager.record_success().await;
    assert_eq!(manager.stats().await.circuit, CircuitState::HalfOpen);
    manager.record_success().await;
    assert_eq!(manager.stats().await.circuit, CircuitState::Closed);
}

#[tokio::test]
async fn probe_failure_reopens() {
    let manager = manager_with_circuit(fast_circuit());
    for _ in 0..5 {
        manager.record_failure("SELECT 1").await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.can_execute().await.allowed);

    manager.record_failure("SELECT 1").await;
    let stats = manager.stats().await;
    assert_eq!(stats.circuit, CircuitState::Open);
    assert!(stats.circuit_opens_in_ms.is_some());
}

#[tokio::test]
async fn explain_analyze_timeouts_leave_the_window_untouched() {
    let manager = manager_with_circuit(fast_circuit());

    let before = manager.stats().await.recent_failures;
    for _ in 0..8 {
        manager
            .record_failure("EXPLAIN ANALYZE SELECT * FROM big")
            .await;
    }
    let after = manager.stats().await.recent_failures;
    assert_eq!(before, after);
    assert!(manager.can_execute().await.allowed);
}

#[tokio::test]
async fn stats_snapshot_has_the_contract_fields() {
    let manager = manager_with_circuit(fast_circuit());
    manager.record_success().await;

    let stats = manager.stats().await;
    let json = serde_json::to_value(&stats).unwrap();
    for field in [
        "status",
        "circuit",
        "circuit_opens_in_ms",
        "latency_ms",
        "latency_p95_ms",
        "recent_failures",
        "last_success",
        "last_failure",
        "uptime_percent",
    ] {
        assert!(json.get(field).is_some(), "missing field {field}");
    }
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["circuit"], "closed");
    assert!(json["circuit_opens_in_ms"].is_null());
}
