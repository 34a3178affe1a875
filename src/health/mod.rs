// SPDX-License-Identifier: MIT
//! Database health monitoring.
//!
//! A background prober issues a trivial liveness round-trip through a
//! caller-supplied [`Ping`] and maintains a healthy/degraded/unhealthy
//! classification plus a small rolling latency sample. The classification is
//! an *input* to the timeout planner, never a gate: the monitor does not talk
//! to the circuit breaker and shares no state with it.
//!
//! Classification moves one adjacent step per probe:
//!
//! ```text
//! healthy ──(1 failure)──► degraded ──(3 consecutive failures)──► unhealthy
//! healthy ◄─(3 consecutive successes)── degraded ◄─(1 success)── unhealthy
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HealthSettings, TimeoutSettings};

/// Rolling latency sample capacity; newest entry wins.
pub const LATENCY_SAMPLE_SIZE: usize = 10;

/// Delay before the first scheduled probe, so startup races settle first.
const WARMUP_DELAY: Duration = Duration::from_secs(5);

/// Consecutive successes needed to move degraded → healthy.
const SUCCESSES_TO_RECOVER: u32 = 3;

/// Consecutive failures needed to move degraded → unhealthy.
const FAILURES_TO_COLLAPSE: u32 = 3;

/// Current database reachability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthLevel::Healthy => write!(f, "healthy"),
            HealthLevel::Degraded => write!(f, "degraded"),
            HealthLevel::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A trivial liveness round-trip, supplied by the database layer.
#[async_trait]
pub trait Ping: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Copy of the monitor state at one point in time.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub level: HealthLevel,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_latency: Option<Duration>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct MonitorInner {
    level: HealthLevel,
    last_check: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_latency: Option<Duration>,
    latencies: VecDeque<Duration>,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl MonitorInner {
    fn new() -> Self {
        Self {
            level: HealthLevel::Healthy,
            last_check: None,
            last_success: None,
            last_failure: None,
            last_latency: None,
            latencies: VecDeque::with_capacity(LATENCY_SAMPLE_SIZE),
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    fn transition(&mut self, to: HealthLevel) {
        info!(from = %self.level, to = %to, "database health changed");
        self.level = to;
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
    }
}

/// Health monitor. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<RwLock<MonitorInner>>,
    ping: Arc<dyn Ping>,
    probe_deadline: Duration,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(
        ping: Arc<dyn Ping>,
        timeouts: &TimeoutSettings,
        settings: HealthSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MonitorInner::new())),
            ping,
            probe_deadline: timeouts.health_probe,
            settings,
        }
    }

    /// Run one probe and fold its outcome into the classification.
    ///
    /// The ping is raced against the probe deadline; reaching the deadline
    /// counts as a failure. Returns whether the probe succeeded.
    pub async fn probe(&self) -> bool {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.probe_deadline, self.ping.ping()).await;
        let latency = start.elapsed();

        let ok = match &outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(err = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(
                    deadline_ms = self.probe_deadline.as_millis() as u64,
                    "health probe timed out"
                );
                false
            }
        };

        let mut inner = self.inner.write().await;
        inner.last_check = Some(Utc::now());
        if ok {
            inner.last_success = Some(Utc::now());
            inner.last_latency = Some(latency);
            if inner.latencies.len() == LATENCY_SAMPLE_SIZE {
                inner.latencies.pop_front();
            }
            inner.latencies.push_back(latency);
            inner.consecutive_failures = 0;
            inner.consecutive_successes += 1;
            match inner.level {
                HealthLevel::Unhealthy => inner.transition(HealthLevel::Degraded),
                HealthLevel::Degraded if inner.consecutive_successes >= SUCCESSES_TO_RECOVER => {
                    inner.transition(HealthLevel::Healthy)
                }
                _ => {}
            }
        } else {
            inner.last_failure = Some(Utc::now());
            inner.consecutive_successes = 0;
            inner.consecutive_failures += 1;
            match inner.level {
                HealthLevel::Healthy => inner.transition(HealthLevel::Degraded),
                HealthLevel::Degraded if inner.consecutive_failures >= FAILURES_TO_COLLAPSE => {
                    inner.transition(HealthLevel::Unhealthy)
                }
                _ => {}
            }
        }
        ok
    }

    /// Current classification.
    pub async fn level(&self) -> HealthLevel {
        self.inner.read().await.level
    }

    /// Copy of the full monitor state.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.read().await;
        HealthSnapshot {
            level: inner.level,
            last_check: inner.last_check,
            last_success: inner.last_success,
            last_failure: inner.last_failure,
            last_latency: inner.last_latency,
            consecutive_successes: inner.consecutive_successes,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// 95th percentile of the rolling latency sample, or zero when empty.
    pub async fn latency_p95(&self) -> Duration {
        let inner = self.inner.read().await;
        if inner.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = inner.latencies.iter().copied().collect();
        sorted.sort();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }

    /// Start the background prober.
    ///
    /// One long-lived task: waits out the warmup, then probes and re-sleeps
    /// `check_interval` while healthy, `degraded_interval` otherwise. The
    /// returned handle's `stop()` cancels any outstanding delay.
    pub fn spawn_scheduler(&self) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = self.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(WARMUP_DELAY) => {}
                _ = stop_rx.changed() => return,
            }
            loop {
                monitor.probe().await;
                let interval = match monitor.level().await {
                    HealthLevel::Healthy => monitor.settings.check_interval,
                    _ => monitor.settings.degraded_interval,
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("health scheduler stopped");
        });

        SchedulerHandle {
            stop: stop_tx,
            handle,
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("probe_deadline", &self.probe_deadline)
            .finish()
    }
}

/// Handle to the running scheduler task.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the scheduler, cancelling any in-progress inter-probe delay.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(err = %e, "health scheduler join failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Ping whose outcome is flipped from the test.
    struct FlagPing {
        ok: AtomicBool,
    }

    impl FlagPing {
        fn new(ok: bool) -> Arc<Self> {
            Arc::new(Self {
                ok: AtomicBool::new(ok),
            })
        }

        fn set(&self, ok: bool) {
            self.ok.store(ok, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Ping for FlagPing {
        async fn ping(&self) -> anyhow::Result<()> {
            if self.ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                anyhow::bail!("probe refused")
            }
        }
    }

    /// Ping that sleeps past any reasonable probe deadline.
    struct SlowPing;

    #[async_trait]
    impl Ping for SlowPing {
        async fn ping(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn monitor_with(ping: Arc<dyn Ping>) -> HealthMonitor {
        let timeouts = TimeoutSettings {
            health_probe: Duration::from_millis(50),
            ..TimeoutSettings::default()
        };
        HealthMonitor::new(ping, &timeouts, HealthSettings::default())
    }

    #[tokio::test]
    async fn starts_healthy() {
        let monitor = monitor_with(FlagPing::new(true));
        assert_eq!(monitor.level().await, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn first_failure_degrades() {
        let monitor = monitor_with(FlagPing::new(false));
        monitor.probe().await;
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
    }

    #[tokio::test]
    async fn collapse_requires_three_consecutive_failures() {
        let ping = FlagPing::new(false);
        let monitor = monitor_with(ping.clone());

        monitor.probe().await; // healthy → degraded
        monitor.probe().await;
        monitor.probe().await;
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
        monitor.probe().await; // third consecutive failure in degraded
        assert_eq!(monitor.level().await, HealthLevel::Unhealthy);
    }

    #[tokio::test]
    async fn classification_never_skips_a_step() {
        let ping = FlagPing::new(false);
        let monitor = monitor_with(ping.clone());

        monitor.probe().await;
        assert_eq!(monitor.level().await, HealthLevel::Degraded);

        ping.set(true);
        monitor.probe().await;
        // One success from degraded does not jump anywhere.
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
    }

    #[tokio::test]
    async fn recovery_path_unhealthy_to_healthy() {
        let ping = FlagPing::new(false);
        let monitor = monitor_with(ping.clone());
        for _ in 0..4 {
            monitor.probe().await;
        }
        assert_eq!(monitor.level().await, HealthLevel::Unhealthy);

        ping.set(true);
        monitor.probe().await; // one success bumps to degraded
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
        monitor.probe().await;
        monitor.probe().await;
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
        monitor.probe().await; // third consecutive success in degraded
        assert_eq!(monitor.level().await, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn failure_resets_recovery_progress() {
        let ping = FlagPing::new(false);
        let monitor = monitor_with(ping.clone());
        for _ in 0..4 {
            monitor.probe().await;
        }
        ping.set(true);
        monitor.probe().await; // → degraded
        monitor.probe().await; // 1 of 3
        ping.set(false);
        monitor.probe().await; // resets the success run (1 failure in degraded)
        ping.set(true);
        monitor.probe().await;
        monitor.probe().await;
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
        monitor.probe().await;
        assert_eq!(monitor.level().await, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn probe_deadline_counts_as_failure() {
        let monitor = monitor_with(Arc::new(SlowPing));
        let ok = monitor.probe().await;
        assert!(!ok);
        assert_eq!(monitor.level().await, HealthLevel::Degraded);
        let snapshot = monitor.snapshot().await;
        assert!(snapshot.last_failure.is_some());
        assert!(snapshot.last_success.is_none());
    }

    #[tokio::test]
    async fn empty_sample_has_zero_p95() {
        let monitor = monitor_with(FlagPing::new(true));
        assert_eq!(monitor.latency_p95().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn p95_is_the_tail_of_a_full_sample() {
        let monitor = monitor_with(FlagPing::new(true));
        {
            let mut inner = monitor.inner.write().await;
            for ms in [5u64, 12, 7, 40, 3, 9, 15, 6, 22, 180] {
                inner.latencies.push_back(Duration::from_millis(ms));
            }
        }
        // ceil(10 * 0.95) = 10 → the largest element.
        assert_eq!(monitor.latency_p95().await, Duration::from_millis(180));
    }

    #[tokio::test]
    async fn p95_of_single_sample_is_that_sample() {
        let monitor = monitor_with(FlagPing::new(true));
        monitor
            .inner
            .write()
            .await
            .latencies
            .push_back(Duration::from_millis(8));
        assert_eq!(monitor.latency_p95().await, Duration::from_millis(8));
    }

    #[tokio::test]
    async fn sample_is_bounded_to_capacity() {
        let monitor = monitor_with(FlagPing::new(true));
        for _ in 0..25 {
            monitor.probe().await;
        }
        let inner = monitor.inner.read().await;
        assert_eq!(inner.latencies.len(), LATENCY_SAMPLE_SIZE);
    }

    #[tokio::test]
    async fn scheduler_stop_cancels_pending_delay() {
        let monitor = monitor_with(FlagPing::new(true));
        let handle = monitor.spawn_scheduler();
        // Stop while the scheduler is still inside the warmup delay; this
        // must return promptly rather than waiting out the sleep.
        let stopped =
            tokio::time::timeout(Duration::from_millis(500), handle.stop()).await;
        assert!(stopped.is_ok());
    }
}
