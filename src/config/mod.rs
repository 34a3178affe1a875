//! Gateway configuration.
//!
//! All settings are read once at startup from `PGWARD_*` environment
//! variables layered over built-in defaults, then frozen. A malformed value
//! is a startup error; the process refuses to run on a half-parsed config.
//!
//! `DATABASE_URL` (or `PGWARD_CONNECTION_STRING`) overrides the individual
//! host/port/database/user/password parts when present.

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// How to reach the database.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    /// Full connection string; wins over the individual parts when set.
    pub connection_string: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl: false,
            connection_string: None,
        }
    }
}

/// Wall-clock deadlines for the three wait classes.
#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    /// Default statement deadline before adaptive multipliers.
    pub base: Duration,
    /// Hard cap on connection acquisition, independent of the statement deadline.
    pub connect: Duration,
    /// Deadline for a single health probe round-trip.
    pub health_probe: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10_000),
            connect: Duration::from_millis(2_000),
            health_probe: Duration::from_millis(2_000),
        }
    }
}

/// Connection pool sizing and lifecycle.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    /// A connection older than this is closed on release instead of reused.
    pub connection_ttl: Duration,
    /// Idle connections older than this are swept.
    pub idle_timeout: Duration,
    /// Re-validate aged connections with a short ping before handing them out.
    pub validate_on_borrow: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            connection_ttl: Duration::from_millis(300_000),
            idle_timeout: Duration::from_millis(60_000),
            validate_on_borrow: true,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitSettings {
    /// Failures within the window before the circuit opens.
    pub failure_threshold: u32,
    /// Sliding window over which failures accumulate.
    pub failure_window: Duration,
    /// How long the circuit stays open before admitting a probe.
    pub open_duration: Duration,
    /// Successes required in half-open before closing.
    pub recovery_threshold: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_millis(60_000),
            open_duration: Duration::from_millis(30_000),
            recovery_threshold: 2,
        }
    }
}

/// Health probe scheduling.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Inter-probe delay while the database is healthy.
    pub check_interval: Duration,
    /// Inter-probe delay while degraded or unhealthy.
    pub degraded_interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(30_000),
            degraded_interval: Duration::from_millis(5_000),
        }
    }
}

/// Adaptive timeout planning.
#[derive(Debug, Clone)]
pub struct AdaptiveSettings {
    pub enabled: bool,
    /// Lower clamp on every planned deadline.
    pub min_timeout: Duration,
    /// Upper clamp on every planned deadline.
    pub max_timeout: Duration,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_timeout: Duration::from_millis(2_000),
            max_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Pre-flight SQL policy inputs.
#[derive(Debug, Clone, Default)]
pub struct SafetySettings {
    /// Tables the agent may never touch (comma list in `PGWARD_BLACKLIST_TABLES`).
    pub blacklist_tables: Vec<String>,
    /// Columns the agent may never read or return.
    pub blacklist_columns: Vec<String>,
    /// LIMIT appended to bare SELECTs.
    pub default_row_limit: u64,
}

/// The complete, immutable gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database: DatabaseSettings,
    pub timeouts: TimeoutSettings,
    pub pool: PoolSettings,
    pub circuit: CircuitSettings,
    pub health: HealthSettings,
    pub adaptive: AdaptiveSettings,
    pub safety: SafetySettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            timeouts: TimeoutSettings::default(),
            pool: PoolSettings::default(),
            circuit: CircuitSettings::default(),
            health: HealthSettings::default(),
            adaptive: AdaptiveSettings::default(),
            safety: SafetySettings {
                default_row_limit: 1_000,
                ..SafetySettings::default()
            },
        }
    }
}

impl GatewayConfig {
    /// Load the configuration from the environment over defaults.
    ///
    /// Returns an error on any malformed value; the caller treats that as
    /// fatal.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        let db = &mut config.database;
        db.host = env_string("PGWARD_HOST", &db.host);
        db.port = env_parse("PGWARD_PORT", db.port)?;
        db.database = env_string("PGWARD_DATABASE", &db.database);
        db.user = env_string("PGWARD_USER", &db.user);
        db.password = env_string("PGWARD_PASSWORD", &db.password);
        db.ssl = env_bool("PGWARD_SSL", db.ssl)?;
        db.connection_string = std::env::var("PGWARD_CONNECTION_STRING")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|s| !s.is_empty());

        let t = &mut config.timeouts;
        t.base = env_ms("PGWARD_BASE_TIMEOUT_MS", t.base)?;
        t.connect = env_ms("PGWARD_CONNECTION_TIMEOUT_MS", t.connect)?;
        t.health_probe = env_ms("PGWARD_HEALTH_CHECK_TIMEOUT_MS", t.health_probe)?;

        let p = &mut config.pool;
        p.max_connections = env_parse("PGWARD_MAX_CONNECTIONS", p.max_connections)?;
        p.min_connections = env_parse("PGWARD_MIN_CONNECTIONS", p.min_connections)?;
        p.connection_ttl = env_ms("PGWARD_CONNECTION_TTL_MS", p.connection_ttl)?;
        p.idle_timeout = env_ms("PGWARD_IDLE_TIMEOUT_MS", p.idle_timeout)?;
        p.validate_on_borrow = env_bool("PGWARD_VALIDATE_ON_BORROW", p.validate_on_borrow)?;

        let c = &mut config.circuit;
        c.failure_threshold = env_parse("PGWARD_CIRCUIT_FAILURE_THRESHOLD", c.failure_threshold)?;
        c.failure_window = env_ms("PGWARD_CIRCUIT_FAILURE_WINDOW_MS", c.failure_window)?;
        c.open_duration = env_ms("PGWARD_CIRCUIT_OPEN_DURATION_MS", c.open_duration)?;
        c.recovery_threshold =
            env_parse("PGWARD_CIRCUIT_RECOVERY_THRESHOLD", c.recovery_threshold)?;

        let h = &mut config.health;
        h.check_interval = env_ms("PGWARD_HEALTH_CHECK_INTERVAL_MS", h.check_interval)?;
        h.degraded_interval = env_ms("PGWARD_HEALTH_DEGRADED_INTERVAL_MS", h.degraded_interval)?;

        let a = &mut config.adaptive;
        a.enabled = env_bool("PGWARD_ADAPTIVE_TIMEOUT", a.enabled)?;
        a.min_timeout = env_ms("PGWARD_MIN_TIMEOUT_MS", a.min_timeout)?;
        a.max_timeout = env_ms("PGWARD_MAX_TIMEOUT_MS", a.max_timeout)?;

        let s = &mut config.safety;
        s.blacklist_tables = env_list("PGWARD_BLACKLIST_TABLES");
        s.blacklist_columns = env_list("PGWARD_BLACKLIST_COLUMNS");
        s.default_row_limit = env_parse("PGWARD_DEFAULT_ROW_LIMIT", s.default_row_limit)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings before anything is built on top of them.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            bail!("PGWARD_MAX_CONNECTIONS must be at least 1");
        }
        if self.pool.min_connections > self.pool.max_connections {
            bail!(
                "PGWARD_MIN_CONNECTIONS ({}) exceeds PGWARD_MAX_CONNECTIONS ({})",
                self.pool.min_connections,
                self.pool.max_connections
            );
        }
        if self.adaptive.min_timeout > self.adaptive.max_timeout {
            bail!(
                "PGWARD_MIN_TIMEOUT_MS ({}ms) exceeds PGWARD_MAX_TIMEOUT_MS ({}ms)",
                self.adaptive.min_timeout.as_millis(),
                self.adaptive.max_timeout.as_millis()
            );
        }
        if self.circuit.failure_threshold == 0 {
            bail!("PGWARD_CIRCUIT_FAILURE_THRESHOLD must be at least 1");
        }
        if self.circuit.recovery_threshold == 0 {
            bail!("PGWARD_CIRCUIT_RECOVERY_THRESHOLD must be at least 1");
        }
        if self.timeouts.connect.is_zero() || self.timeouts.base.is_zero() {
            bail!("timeouts must be non-zero");
        }
        Ok(())
    }

    /// The subset echoed back in the health snapshot.
    pub fn echo(&self) -> serde_json::Value {
        serde_json::json!({
            "base_timeout_ms": self.timeouts.base.as_millis() as u64,
            "connection_timeout_ms": self.timeouts.connect.as_millis() as u64,
            "max_connections": self.pool.max_connections,
            "circuit_failure_threshold": self.circuit.failure_threshold,
            "circuit_open_duration_ms": self.circuit.open_duration.as_millis() as u64,
            "adaptive_timeout": self.adaptive.enabled,
        })
    }
}

// ─── Environment parsing helpers ─────────────────────────────────────────────

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {v:?}")),
        _ => Ok(default),
    }
}

fn env_ms(key: &str, default: Duration) -> Result<Duration> {
    let ms: u64 = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid boolean for {key}: {other:?}"),
        },
        _ => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.timeouts.base, Duration::from_millis(10_000));
        assert_eq!(config.timeouts.connect, Duration::from_millis(2_000));
        assert_eq!(config.timeouts.health_probe, Duration::from_millis(2_000));
        assert_eq!(config.pool.max_connections, 5);
        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.pool.connection_ttl, Duration::from_millis(300_000));
        assert_eq!(config.pool.idle_timeout, Duration::from_millis(60_000));
        assert!(config.pool.validate_on_borrow);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.failure_window, Duration::from_millis(60_000));
        assert_eq!(config.circuit.open_duration, Duration::from_millis(30_000));
        assert_eq!(config.circuit.recovery_threshold, 2);
        assert_eq!(config.health.check_interval, Duration::from_millis(30_000));
        assert_eq!(config.health.degraded_interval, Duration::from_millis(5_000));
        assert!(config.adaptive.enabled);
        assert_eq!(config.adaptive.min_timeout, Duration::from_millis(2_000));
        assert_eq!(config.adaptive.max_timeout, Duration::from_millis(30_000));
        assert_eq!(config.safety.default_row_limit, 1_000);
    }

    #[test]
    fn validate_rejects_inverted_pool_bounds() {
        let mut config = GatewayConfig::default();
        config.pool.min_connections = 10;
        config.pool.max_connections = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_timeout_clamps() {
        let mut config = GatewayConfig::default();
        config.adaptive.min_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let mut config = GatewayConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn echo_contains_key_settings() {
        let echo = GatewayConfig::default().echo();
        assert_eq!(echo["base_timeout_ms"], 10_000);
        assert_eq!(echo["max_connections"], 5);
        assert_eq!(echo["adaptive_timeout"], true);
    }
}
