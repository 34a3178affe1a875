// SPDX-License-Identifier: MIT
//! PostgreSQL pool construction.
//!
//! The whole pool discipline is expressed through `PgPoolOptions`: bounded
//! size with a warm floor, TTL-bounded connection age (`max_lifetime`), idle
//! sweep (`idle_timeout`), a hard acquisition deadline (`acquire_timeout`),
//! and borrow-time validation via the `before_acquire` hook. The pool is
//! constructed lazily so startup never blocks on the database.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgPool};
use tracing::{debug, warn};

use crate::config::{DatabaseSettings, GatewayConfig};
use crate::health::Ping;

pub mod executor;
pub mod rows;

/// Connections younger than this skip borrow-time validation.
const VALIDATE_AGE_THRESHOLD: Duration = Duration::from_secs(30);

/// Deadline for the borrow-time validation ping.
const VALIDATE_DEADLINE: Duration = Duration::from_secs(1);

/// Build the connection pool from configuration.
///
/// Uses `connect_lazy_with`: the first caller pays connection establishment,
/// under its connect deadline.
pub fn connect(config: &GatewayConfig) -> Result<PgPool> {
    let options = connect_options(&config.database)?;

    let mut pool_options = PgPoolOptions::new()
        .max_connections(config.pool.max_connections)
        .min_connections(config.pool.min_connections)
        .max_lifetime(config.pool.connection_ttl)
        .idle_timeout(config.pool.idle_timeout)
        .acquire_timeout(config.timeouts.connect);

    if config.pool.validate_on_borrow {
        pool_options = pool_options.before_acquire(|conn, meta| {
            Box::pin(async move {
                if meta.age < VALIDATE_AGE_THRESHOLD {
                    return Ok(true);
                }
                // Aged connection: confirm it is still alive before handing
                // it out. Returning false discards it and the pool retries
                // within the remaining acquire window.
                match tokio::time::timeout(VALIDATE_DEADLINE, conn.ping()).await {
                    Ok(Ok(())) => Ok(true),
                    Ok(Err(e)) => {
                        warn!(age_s = meta.age.as_secs(), err = %e, "discarding dead pooled connection");
                        Ok(false)
                    }
                    Err(_) => {
                        warn!(age_s = meta.age.as_secs(), "pooled connection validation timed out; discarding");
                        Ok(false)
                    }
                }
            })
        });
    }

    debug!(
        max = config.pool.max_connections,
        min = config.pool.min_connections,
        ttl_s = config.pool.connection_ttl.as_secs(),
        "constructing connection pool"
    );
    Ok(pool_options.connect_lazy_with(options))
}

fn connect_options(db: &DatabaseSettings) -> Result<PgConnectOptions> {
    if let Some(url) = &db.connection_string {
        return PgConnectOptions::from_str(url).context("invalid connection string");
    }
    let ssl_mode = if db.ssl {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    };
    Ok(PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .database(&db.database)
        .username(&db.user)
        .password(&db.password)
        .ssl_mode(ssl_mode))
}

/// Liveness round-trip over the shared pool, used by the health monitor.
pub struct PoolPing {
    pool: PgPool,
}

impl PoolPing {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl Ping for PoolPing {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("health probe query")?;
        Ok(())
    }
}
