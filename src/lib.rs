pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod health;
pub mod introspect;
pub mod rpc;
pub mod safety;
pub mod timeouts;

use std::sync::Arc;

use tokio::sync::watch;

use config::GatewayConfig;
use db::executor::Executor;
use guard::GuardManager;
use safety::SafetyPolicy;

/// Shared application state passed to every RPC handler and background task.
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    /// The guard façade every database call traverses.
    pub guard: Arc<GuardManager>,
    /// Guarded statement executor over the shared pool.
    pub executor: Executor,
    /// Pre-flight SQL policies applied by the tool handlers.
    pub policy: Arc<SafetyPolicy>,
    /// Broadcast to in-flight calls on shutdown; they surface `cancelled`.
    pub shutdown: watch::Sender<bool>,
}

impl AppContext {
    /// Wire up the full gateway over an already-constructed pool.
    pub fn new(config: Arc<GatewayConfig>, pool: sqlx::PgPool) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ping = db::PoolPing::new(pool.clone());
        let guard = Arc::new(GuardManager::new(&config, ping));
        let executor = Executor::new(
            pool,
            guard.clone(),
            config.timeouts.connect,
            shutdown_rx,
        );
        let policy = Arc::new(SafetyPolicy::new(&config.safety));

        Arc::new(Self {
            config,
            guard,
            executor,
            policy,
            shutdown: shutdown_tx,
        })
    }
}
