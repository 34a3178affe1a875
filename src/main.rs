use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pgward::{config::GatewayConfig, db, rpc, AppContext};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "pgward",
    about = "Safety-and-reliability PostgreSQL gateway for AI agents",
    version
)]
struct Args {
    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PGWARD_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the JSON-RPC channel.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "pgward starting");

    // Both of these are fatal: a half-parsed config or an unbuildable pool
    // must abort before anything is served.
    let config = Arc::new(GatewayConfig::from_env().context("loading configuration")?);
    let pool = db::connect(&config).context("constructing connection pool")?;

    info!(
        host = %config.database.host,
        database = %config.database.database,
        max_connections = config.pool.max_connections,
        "connection pool ready"
    );

    let ctx = AppContext::new(config, pool);

    let scheduler = ctx.guard.health().spawn_scheduler();

    rpc::run(ctx.clone()).await?;

    // Ordered teardown: stop the prober first, then drain the pool.
    scheduler.stop().await;
    ctx.executor.pool().close().await;
    info!("pgward stopped");

    Ok(())
}
