//! A claimed message handed to the application

use tracing::{debug, warn};

use super::{Consumer, ConsumerState, ConsumerStats};
use crate::error::Result;
use crate::messaging::{AckOutcome, Message, MessageId};

/// A message claimed by a [`Consumer`]
///
/// Holds the consumer mutably until dropped. Call [`Delivery::ack`] once the
/// work is done; dropping an un-acked delivery abandons it and the message
/// stays `consumed` until something requeues it.
#[derive(Debug)]
pub struct Delivery<'c> {
    consumer: &'c mut Consumer,
    message: Message,
    settled: bool,
}

impl<'c> Delivery<'c> {
    pub(super) fn new(consumer: &'c mut Consumer, message: Message) -> Self {
        Self {
            consumer,
            message,
            settled: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn queue_name(&self) -> &str {
        &self.message.queue_name
    }

    /// Whether an ack call has already completed
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Mark the message `done`
    ///
    /// Safe to retry after an error and to call more than once: a repeated
    /// call reports [`AckOutcome::AlreadyDone`].
    pub async fn ack(&mut self) -> Result<AckOutcome> {
        let outcome = self
            .consumer
            .table
            .ack(&self.message.queue_name, &self.message.id)
            .await?;

        match outcome {
            AckOutcome::Acked => {
                ConsumerStats::incr(&self.consumer.stats.acks);
                debug!(message_id = %self.message.id, "Message acknowledged");
            }
            AckOutcome::AlreadyDone => {
                debug!(message_id = %self.message.id, "Message already acknowledged");
            }
            AckOutcome::NotInFlight => {
                warn!(
                    message_id = %self.message.id,
                    "Message was requeued before it could be acknowledged"
                );
            }
        }
        self.settled = true;
        Ok(outcome)
    }

    /// Give the message up without acknowledging it
    pub fn abandon(self) {
        drop(self);
    }
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        if !self.settled {
            ConsumerStats::incr(&self.consumer.stats.abandoned);
            warn!(
                consumer_id = %self.consumer.id,
                message_id = %self.message.id,
                "Delivery dropped without ack; message stays consumed"
            );
        }
        if self.consumer.state == ConsumerState::Delivered {
            self.consumer.state = ConsumerState::Idle;
        }
    }
}
