// SPDX-License-Identifier: MIT
//! Circuit breaker guarding every database call.
//!
//! When the database starts failing repeatedly, the circuit opens and calls
//! fail fast instead of queuing behind connect timeouts.
//!
//! # State machine
//!
//! ```text
//! Closed ──(threshold failures within window)──► Open
//!   ▲                                              │
//!   └──(recovery_threshold successes)── HalfOpen ◄─(open_duration elapsed)──┘
//! ```
//!
//! - **Closed**: calls pass through; failure timestamps accumulate in a
//!   sliding window.
//! - **Open**: calls are rejected immediately with a retry hint. Once
//!   `open_duration` elapses, `can_execute` transitions to HalfOpen *before*
//!   admitting the caller, so that caller becomes the probe.
//! - **HalfOpen**: a single probe is in flight at a time; concurrent callers
//!   are rejected until its outcome lands. `recovery_threshold` successes
//!   close the circuit, any failure reopens it with a fresh timer.
//!
//! Failures flagged as excluded (diagnostic EXPLAIN ANALYZE runs) never touch
//! the window. The window is pruned on every read and mutation; no background
//! timer is involved.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::CircuitSettings;

/// Observable state of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing: calls are rejected without touching the database.
    Open,
    /// Testing recovery: calls are admitted as probes.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of asking the breaker for permission.
#[derive(Debug, Clone)]
pub struct CircuitDecision {
    pub allowed: bool,
    /// Present when the call was rejected, e.g. "Circuit open. Retry in 30s".
    pub reason: Option<String>,
}

impl CircuitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Point-in-time view used by the stats snapshot.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failures currently inside the window.
    pub recent_failures: usize,
    /// Time until the open circuit admits a probe; None unless open.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Monotonically non-decreasing failure timestamps, pruned to the window.
    failures: VecDeque<Instant>,
    /// Set exactly when the state is Open.
    opened_at: Option<Instant>,
    half_open_successes: u32,
    /// An admitted half-open probe whose outcome has not been recorded yet.
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while self
            .failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            self.failures.pop_front();
        }
    }
}

/// Thread-safe sliding-window circuit breaker.
///
/// Cheaply cloneable; all clones share state via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: Arc<CircuitSettings>,
}

impl CircuitBreaker {
    /// Create a breaker in the Closed state.
    pub fn new(config: CircuitSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner::new())),
            config: Arc::new(config),
        }
    }

    /// Ask permission to execute a call.
    ///
    /// In Open state this performs the Open → HalfOpen transition once
    /// `open_duration` has elapsed, *before* returning, so the admitted call
    /// is the recovery probe. While a probe's outcome is pending, further
    /// callers are rejected rather than piled onto a possibly-still-broken
    /// backend.
    pub async fn can_execute(&self) -> CircuitDecision {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.prune(self.config.failure_window, now);

        match inner.state {
            CircuitState::Closed => CircuitDecision::allow(),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    CircuitDecision::reject(
                        "Circuit half-open. Probe in flight; retry shortly".to_string(),
                    )
                } else {
                    inner.probe_in_flight = true;
                    CircuitDecision::allow()
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(self.config.open_duration);
                if elapsed >= self.config.open_duration {
                    info!(circuit = %CircuitState::HalfOpen, "circuit admitting recovery probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    CircuitDecision::allow()
                } else {
                    let remaining = self.config.open_duration - elapsed;
                    let secs = (remaining.as_millis() as u64).div_ceil(1000);
                    CircuitDecision::reject(format!("Circuit open. Retry in {secs}s"))
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// A no-op in Closed; in HalfOpen, counts toward recovery and closes the
    /// circuit once `recovery_threshold` successes are recorded.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.probe_in_flight = false;
        inner.half_open_successes += 1;
        if inner.half_open_successes >= self.config.recovery_threshold {
            info!(
                successes = inner.half_open_successes,
                "circuit closed (recovered)"
            );
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.opened_at = None;
            inner.half_open_successes = 0;
        }
    }

    /// Record a failed call.
    ///
    /// `excluded` failures (diagnostic calls) contribute nothing. Otherwise
    /// the timestamp enters the window; crossing the threshold in Closed, or
    /// any failure in HalfOpen, opens the circuit.
    pub async fn record_failure(&self, excluded: bool) {
        if excluded {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.failures.push_back(now);
        inner.prune(self.config.failure_window, now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        failures = inner.failures.len(),
                        window_ms = self.config.failure_window.as_millis() as u64,
                        "circuit opened (failure threshold reached)"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit reopened (recovery probe failed)");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Snapshot for the stats surface. Prunes the window first.
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.prune(self.config.failure_window, now);
        let retry_in = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .open_duration
                    .saturating_sub(now.duration_since(at)),
            ),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            recent_failures: inner.failures.len(),
            retry_in,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("failure_threshold", &self.config.failure_threshold)
            .finish()
    }
}
