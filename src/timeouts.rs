// SPDX-License-Identifier: MIT
//! Adaptive timeout planning.
//!
//! Pure mapping from (query text, current health, optional user override) to
//! a statement deadline and a human-readable reason. Cheap enough to run on
//! every call: query shape comes from a fixed set of compiled regexes, not a
//! SQL parser. The planner's output is advisory; the executor is
//! authoritative for actually applying the deadline.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AdaptiveSettings;
use crate::health::HealthLevel;

static JOIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bJOIN\b").expect("regex: join"));
static SUBQUERY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\(\s*SELECT\b").expect("regex: subquery"));
static AGGREGATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(COUNT|SUM|AVG|MAX|MIN|GROUP BY)\b").expect("regex: aggregate")
});
static FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFROM\b").expect("regex: from"));
static EXPLAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bEXPLAIN\b").expect("regex: explain"));
static ANALYZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bANALYZE\b").expect("regex: analyze"));

/// Structural fingerprint of a query, derived by substring scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryShape {
    pub has_join: bool,
    pub has_subquery: bool,
    pub has_aggregation: bool,
    pub is_explain_analyze: bool,
    /// FROM occurrences, a rough proxy for the number of tables involved.
    pub table_count: usize,
}

impl QueryShape {
    pub fn detect(sql: &str) -> Self {
        Self {
            has_join: JOIN_RE.is_match(sql),
            has_subquery: SUBQUERY_RE.is_match(sql),
            has_aggregation: AGGREGATE_RE.is_match(sql),
            is_explain_analyze: EXPLAIN_RE.is_match(sql) && ANALYZE_RE.is_match(sql),
            table_count: FROM_RE.find_iter(sql).count(),
        }
    }
}

/// The planner's output: an effective deadline and why it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPlan {
    pub duration: Duration,
    pub reason: String,
}

/// Stateless deadline planner.
#[derive(Debug, Clone)]
pub struct TimeoutPlanner {
    base: Duration,
    adaptive: AdaptiveSettings,
}

impl TimeoutPlanner {
    pub fn new(base: Duration, adaptive: AdaptiveSettings) -> Self {
        Self { base, adaptive }
    }

    /// Plan the deadline for one statement.
    ///
    /// A user override wins (clamped to the configured bounds, with the
    /// clamp noted in the reason). Otherwise, with adaptive planning
    /// enabled, shape and health multipliers stack onto the base deadline:
    /// EXPLAIN ANALYZE x3 (shape multipliers skipped for diagnostic runs),
    /// JOIN x1.5, subquery x2, multiple FROMs x1.5, aggregation x1.5, then
    /// degraded health x0.5 or unhealthy x0.25.
    pub fn plan(
        &self,
        sql: &str,
        health: HealthLevel,
        user_override_ms: Option<u64>,
    ) -> TimeoutPlan {
        if let Some(ms) = user_override_ms {
            return self.plan_override(ms);
        }
        if !self.adaptive.enabled {
            return TimeoutPlan {
                duration: self.clamp(self.base),
                reason: "base timeout".to_string(),
            };
        }

        let shape = QueryShape::detect(sql);
        let mut multiplier = 1.0_f64;
        let mut fired: Vec<String> = Vec::new();

        if shape.is_explain_analyze {
            multiplier *= 3.0;
            fired.push("EXPLAIN ANALYZE (3x)".to_string());
        } else {
            if shape.has_join {
                multiplier *= 1.5;
                fired.push("JOIN (1.5x)".to_string());
            }
            if shape.has_subquery {
                multiplier *= 2.0;
                fired.push("subquery (2x)".to_string());
            }
            if shape.table_count > 1 {
                multiplier *= 1.5;
                fired.push("multiple tables (1.5x)".to_string());
            }
            if shape.has_aggregation {
                multiplier *= 1.5;
                fired.push("aggregation (1.5x)".to_string());
            }
        }

        match health {
            HealthLevel::Healthy => {}
            HealthLevel::Degraded => {
                multiplier *= 0.5;
                fired.push("degraded health (0.5x)".to_string());
            }
            HealthLevel::Unhealthy => {
                multiplier *= 0.25;
                fired.push("unhealthy (0.25x)".to_string());
            }
        }

        let duration = self.clamp(self.base.mul_f64(multiplier));
        let reason = if fired.is_empty() {
            "base timeout".to_string()
        } else {
            fired.join(", ")
        };
        TimeoutPlan { duration, reason }
    }

    fn plan_override(&self, ms: u64) -> TimeoutPlan {
        let requested = Duration::from_millis(ms);
        let clamped = self.clamp(requested);
        let reason = if clamped > requested {
            format!(
                "user override {ms}ms (clamped to minimum {}ms)",
                self.adaptive.min_timeout.as_millis()
            )
        } else if clamped < requested {
            format!(
                "user override {ms}ms (clamped to maximum {}ms)",
                self.adaptive.max_timeout.as_millis()
            )
        } else {
            format!("user override {ms}ms")
        };
        TimeoutPlan {
            duration: clamped,
            reason,
        }
    }

    fn clamp(&self, d: Duration) -> Duration {
        d.clamp(self.adaptive.min_timeout, self.adaptive.max_timeout)
    }
}
