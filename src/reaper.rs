//! # Reaper
//!
//! Explicit recovery of messages stuck in `consumed`, typically because the
//! consumer that claimed them crashed or dropped the delivery. The reaper
//! requeues rows claimed longer ago than a caller-supplied threshold; each
//! requeued row is announced again so idle consumers pick it up.
//!
//! A message whose consumer is merely slow will be delivered a second time
//! once reaped, so the threshold must exceed the longest legitimate
//! processing time.
//!
//! ```rust,ignore
//! let reaper = broker.reaper("jobs", Duration::from_secs(300))?;
//! let handle = reaper.spawn(Duration::from_secs(60))?;
//! // ...
//! handle.stop().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::{BrokerError, Result};
use crate::storage::QueueTable;

/// Requeues stale claims for one queue
#[derive(Debug, Clone)]
pub struct Reaper {
    table: Arc<dyn QueueTable>,
    queue_name: String,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(
        table: Arc<dyn QueueTable>,
        queue_name: impl Into<String>,
        stale_after: Duration,
    ) -> Result<Self> {
        if stale_after.is_zero() {
            return Err(BrokerError::config("reaper stale_after must be greater than 0"));
        }
        Ok(Self {
            table,
            queue_name: queue_name.into(),
            stale_after,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Run a single pass, returning how many messages were requeued
    pub async fn run_once(&self) -> Result<u64> {
        let requeued = self
            .table
            .requeue_stale(&self.queue_name, self.stale_after)
            .await?;

        if requeued > 0 {
            info!(
                queue = %self.queue_name,
                requeued,
                stale_after_secs = self.stale_after.as_secs(),
                "Reaper requeued stale messages"
            );
        } else {
            debug!(queue = %self.queue_name, "No stale messages");
        }
        Ok(requeued)
    }

    /// Run passes every `every` on a background task
    ///
    /// A failed pass is logged and the loop keeps going. `every` must be
    /// greater than zero.
    pub fn spawn(self, every: Duration) -> Result<ReaperHandle> {
        if every.is_zero() {
            return Err(BrokerError::config("reaper interval must be greater than 0"));
        }
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let queue_name = self.queue_name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(queue = %self.queue_name, interval_ms = every.as_millis() as u64, "Reaper started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!(queue = %self.queue_name, "Reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(queue = %self.queue_name, error = %e, "Reaper pass failed");
                        }
                    }
                }
            }
        });

        Ok(ReaperHandle {
            shutdown_tx: Some(shutdown_tx),
            handle,
            queue_name,
        })
    }
}

/// Handle for a running reaper task
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    queue_name: String,
}

impl ReaperHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the reaper and wait for its task to exit
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle
            .await
            .map_err(|e| BrokerError::TaskFailed {
                message: format!("reaper task for {}: {e}", self.queue_name),
            })
    }
}
