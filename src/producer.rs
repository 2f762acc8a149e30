//! # Producer
//!
//! Enqueues messages. An enqueue is an upsert: re-using an id resets that
//! message to `queued` with the new body, which is how callers retry work.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::messaging::{BrokerEvent, ChannelNames, Message, MessageId, MessageState};
use crate::notify::{Notifier, PollOutcome, Subscription};
use crate::storage::QueueTable;
use crate::validation::validate_message_id;

/// Result of waiting for a message to be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckWait {
    Acked,
    TimedOut,
}

/// Publishes messages to queues
#[derive(Debug, Clone)]
pub struct Producer {
    table: Arc<dyn QueueTable>,
    notifier: Arc<dyn Notifier>,
    channels: ChannelNames,
    heartbeat: Duration,
}

impl Producer {
    pub fn new(
        table: Arc<dyn QueueTable>,
        notifier: Arc<dyn Notifier>,
        channels: ChannelNames,
        heartbeat: Duration,
    ) -> Self {
        Self {
            table,
            notifier,
            channels,
            heartbeat,
        }
    }

    /// Enqueue a message that is claimable immediately
    pub async fn enqueue(
        &self,
        queue_name: &str,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
    ) -> Result<MessageId> {
        self.publish(Message::queued(queue_name, id, body)).await
    }

    /// Enqueue a message that becomes claimable after `delay`
    ///
    /// A delay too large to express as a timestamp is rejected with
    /// `InvalidDelay` and nothing is written.
    pub async fn enqueue_delayed(
        &self,
        queue_name: &str,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Result<MessageId> {
        self.publish(Message::delayed(queue_name, id, body, delay)?)
            .await
    }

    #[instrument(skip(self, message), fields(queue = %message.queue_name, message_id = %message.id))]
    async fn publish(&self, message: Message) -> Result<MessageId> {
        self.channels.validate_queue(&message.queue_name)?;
        validate_message_id(message.id.as_str())?;

        self.table.upsert(&message).await?;
        debug!(bytes = message.body.len(), "Message enqueued");
        Ok(message.id)
    }

    /// Enqueue a message and wait until a consumer acknowledges it
    ///
    /// The ack channel is subscribed before the message is written so the
    /// acknowledgment cannot be missed. Notifications are only hints: on every
    /// idle heartbeat the row is read back, so a lost ack notification delays
    /// the answer but never turns it into a timeout.
    pub async fn enqueue_and_wait(
        &self,
        queue_name: &str,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<AckWait> {
        let id = id.into();
        self.channels.validate_queue(queue_name)?;
        let channel = self.channels.ack(queue_name);

        let mut subscription: Option<Box<dyn Subscription>> =
            Some(self.notifier.listen(&channel).await?);
        self.publish(Message::queued(queue_name, id.clone(), body))
            .await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(self.heartbeat);

            let outcome = match subscription.as_mut() {
                Some(sub) => sub.poll(wait).await?,
                None => {
                    tokio::time::sleep(wait).await;
                    PollOutcome::ConnectionLost
                }
            };

            match outcome {
                PollOutcome::Notifications(batch) => {
                    let acked = batch.iter().any(|n| {
                        matches!(
                            BrokerEvent::from_payload(&n.payload),
                            Ok(BrokerEvent::Acked(ref e)) if e.message_id == id
                        )
                    });
                    if acked {
                        info!(queue = %queue_name, message_id = %id, "Message acknowledged");
                        return Ok(AckWait::Acked);
                    }
                }
                PollOutcome::Idle => {
                    if self.is_done(&id).await? {
                        return Ok(AckWait::Acked);
                    }
                }
                PollOutcome::ConnectionLost => {
                    subscription = match self.notifier.listen(&channel).await {
                        Ok(sub) => Some(sub),
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Ack subscription unavailable");
                            None
                        }
                    };
                    if self.is_done(&id).await? {
                        return Ok(AckWait::Acked);
                    }
                }
            }
        }

        if self.is_done(&id).await? {
            return Ok(AckWait::Acked);
        }
        warn!(queue = %queue_name, message_id = %id, "Timed out waiting for acknowledgment");
        Ok(AckWait::TimedOut)
    }

    async fn is_done(&self, id: &MessageId) -> Result<bool> {
        Ok(self
            .table
            .fetch(id)
            .await?
            .is_some_and(|m| m.state == MessageState::Done))
    }
}
