//! Redis connection pool and the queue operations built on it.
//!
//! [`Db`] is constructed once at startup, cloned into every task that
//! needs it, and closed on shutdown. It is the only path to the server.

pub mod consumers;
pub mod keys;
pub mod queue;
pub mod scripts;

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{Connection, Pool, PoolConfig, Runtime, Timeouts};

use crate::config::Config;
use crate::error::{Error, Result};
use scripts::ScriptRegistry;

/// Pool sizing and claim behaviour.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// How long a checkout waits for a free connection.
    pub wait_timeout: Duration,
    /// Claim attempts before reporting contention.
    pub claim_retries: u32,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            max_connections: 50,
            wait_timeout: Duration::from_secs(5),
            claim_retries: 3,
        }
    }
}

impl From<&Config> for DbOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.pool_size,
            wait_timeout: config.pool_wait,
            claim_retries: config.claim_retries,
        }
    }
}

/// Database handle. Owns the connection pool and the script handle cache.
#[derive(Clone)]
pub struct Db {
    pool: Pool,
    scripts: Arc<ScriptRegistry>,
    claim_retries: u32,
}

impl Db {
    /// Connect with default options.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, DbOptions::default()).await
    }

    /// Build the pool and verify the server answers. Failure here is fatal
    /// to a process that depends on the queue.
    pub async fn connect_with(url: &str, options: DbOptions) -> Result<Self> {
        let mut pool_config = PoolConfig::new(options.max_connections);
        pool_config.timeouts = Timeouts {
            wait: Some(options.wait_timeout),
            create: Some(options.wait_timeout),
            recycle: Some(options.wait_timeout),
        };

        let mut config = deadpool_redis::Config::from_url(url);
        config.pool = Some(pool_config);
        let pool = config.create_pool(Some(Runtime::Tokio1))?;

        let db = Self {
            pool,
            scripts: Arc::new(ScriptRegistry::new()),
            claim_retries: options.claim_retries.max(1),
        };
        db.health_check().await?;

        let mut conn = db.conn().await?;
        db.scripts.load_all(&mut conn).await?;

        tracing::info!(
            max_connections = options.max_connections,
            "connected to redis"
        );
        Ok(db)
    }

    /// Simple health check: PING.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::redis("PING", "", e))?;
        if pong != "PONG" {
            return Err(Error::Other(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    /// Close the pool. Checked-out connections are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
    }

    /// The script handle cache.
    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    /// Check out one connection for a logical operation.
    ///
    /// Broken connections are detected on recycle and replaced by the pool.
    pub(crate) async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }
}
