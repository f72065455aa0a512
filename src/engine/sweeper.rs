//! Recovery sweeper: periodically returns expired claims to their queues.
//!
//! Lazy recovery on claim is enough for correctness; the sweeper keeps
//! items from sitting in the claimed list of a queue nobody is claiming from.

use crate::db::Db;
use crate::db::keys::QueueName;
use crate::error::Result;
use crate::model::SweepReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

/// Configuration for the sweeper.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Queues to sweep. Empty means every discovered queue.
    pub queues: Vec<QueueName>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            queues: Vec::new(),
        }
    }
}

/// Drives [`Db::sweep`] on a timer until shut down.
#[derive(Clone)]
pub struct Sweeper {
    db: Arc<Db>,
    config: SweepConfig,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(db: Arc<Db>, config: SweepConfig) -> Self {
        Self {
            db,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the sweeper to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run sweeps until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(interval_ms = self.config.interval.as_millis() as u64, "sweeper started");

        loop {
            match self.sweep_once().await {
                Ok(reports) => {
                    for r in reports.iter().filter(|r| r.restored > 0) {
                        info!(queue = %r.queue, restored = r.restored, scanned = r.scanned, "sweep restored items");
                    }
                }
                Err(e) => error!("sweep error: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sweeper shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// One pass over the configured (or discovered) queues.
    pub async fn sweep_once(&self) -> Result<Vec<SweepReport>> {
        if self.config.queues.is_empty() {
            return self.db.sweep_all().await;
        }
        let mut reports = Vec::with_capacity(self.config.queues.len());
        for queue in &self.config.queues {
            reports.push(self.db.sweep(queue).await?);
        }
        Ok(reports)
    }
}
