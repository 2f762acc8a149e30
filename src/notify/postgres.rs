//! PostgreSQL LISTEN/NOTIFY backend using `sqlx::PgListener`

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{Notification, Notifier, PollOutcome, Subscription};
use crate::error::{BrokerError, Result};

/// Notifier backed by `pg_notify` and `PgListener`
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl std::fmt::Debug for PgNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifier")
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    #[instrument(skip(self), fields(channel = %channel))]
    async fn listen(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| BrokerError::storage("listen", e))?;

        listener
            .listen(channel)
            .await
            .map_err(|e| BrokerError::storage("listen", e))?;

        info!("Now listening to channel: {}", channel);
        Ok(Box::new(PgSubscription {
            channel: channel.to_string(),
            listener,
        }))
    }

    #[instrument(skip(self, payload), fields(channel = %channel))]
    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::storage("notify", e))?;

        debug!("Sent notification to channel: {}", channel);
        Ok(())
    }
}

/// A `PgListener` subscribed to a single channel
pub struct PgSubscription {
    channel: String,
    listener: PgListener,
}

impl std::fmt::Debug for PgSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSubscription")
            .field("channel", &self.channel)
            .finish()
    }
}

fn to_notification(notification: &PgNotification) -> Notification {
    Notification::new(notification.channel(), notification.payload())
}

#[async_trait]
impl Subscription for PgSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome> {
        let first = match tokio::time::timeout(timeout, self.listener.try_recv()).await {
            Err(_elapsed) => return Ok(PollOutcome::Idle),
            Ok(Ok(Some(notification))) => notification,
            // try_recv reports a dropped connection as None rather than an error
            Ok(Ok(None)) => {
                warn!(channel = %self.channel, "Notification connection lost");
                return Ok(PollOutcome::ConnectionLost);
            }
            Ok(Err(e)) => {
                let err = BrokerError::storage("poll", e);
                if err.is_transient() {
                    warn!(channel = %self.channel, error = %err, "Notification connection failed");
                    return Ok(PollOutcome::ConnectionLost);
                }
                return Err(err);
            }
        };

        let mut batch = vec![to_notification(&first)];
        while let Some(notification) = self.listener.next_buffered() {
            batch.push(to_notification(&notification));
        }

        debug!(
            channel = %self.channel,
            count = batch.len(),
            "Received notification batch"
        );
        Ok(PollOutcome::Notifications(batch))
    }
}
