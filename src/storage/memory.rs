//! In-memory queue table
//!
//! Same conditional-update semantics as the PostgreSQL table, backed by a
//! mutex-guarded map. State changes are applied under the lock and announced
//! after it is released.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{QueueDepth, QueueTable};
use crate::error::{BrokerError, Result};
use crate::messaging::{AckOutcome, BrokerEvent, ChannelNames, Message, MessageId, MessageState};
use crate::notify::Notifier;

/// Queue table kept in process memory
#[derive(Debug)]
pub struct InMemoryQueueTable {
    rows: Mutex<HashMap<MessageId, Message>>,
    notifier: Arc<dyn Notifier>,
    channels: ChannelNames,
    max_payload_size: usize,
    outage: AtomicU32,
}

impl InMemoryQueueTable {
    pub fn new(notifier: Arc<dyn Notifier>, channels: ChannelNames, max_payload_size: usize) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            notifier,
            channels,
            max_payload_size,
            outage: AtomicU32::new(0),
        }
    }

    /// Fail the next `operations` table calls with a transient error
    pub fn inject_outage(&self, operations: u32) {
        self.outage.store(operations, Ordering::SeqCst);
    }

    /// Number of stored messages across all queues
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn check_outage(&self, operation: &str) -> Result<()> {
        let hit = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            return Err(BrokerError::unavailable(operation, "injected storage outage"));
        }
        Ok(())
    }

    async fn announce(&self, channel: &str, event: BrokerEvent) -> Result<()> {
        let payload = event.to_payload(self.max_payload_size)?;
        if let Err(e) = self.notifier.notify(channel, &payload).await {
            warn!(channel = %channel, error = %e, "Failed to announce state change");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueTable for InMemoryQueueTable {
    async fn upsert(&self, message: &Message) -> Result<()> {
        self.check_outage("upsert")?;
        let event = BrokerEvent::enqueued(&message.queue_name, message.id.clone());
        // fail before mutating if the announcement cannot be encoded
        event.to_payload(self.max_payload_size)?;

        {
            let mut stored = message.clone();
            stored.state = MessageState::Queued;
            stored.claimed_at = None;
            self.rows.lock().insert(stored.id.clone(), stored);
        }

        self.announce(&self.channels.enqueue(&message.queue_name), event)
            .await
    }

    async fn try_claim(&self, queue_name: &str, id: &MessageId) -> Result<Option<Message>> {
        self.check_outage("try_claim")?;
        let now = Utc::now();
        let mut rows = self.rows.lock();

        match rows.get_mut(id) {
            Some(message)
                if message.queue_name == queue_name
                    && message.state == MessageState::Queued
                    && message.is_available_at(now) =>
            {
                message.state = MessageState::Consumed;
                message.claimed_at = Some(now);
                debug!(message_id = %id, "Claim won");
                Ok(Some(message.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn fetch(&self, id: &MessageId) -> Result<Option<Message>> {
        self.check_outage("fetch")?;
        Ok(self.rows.lock().get(id).cloned())
    }

    async fn ack(&self, queue_name: &str, id: &MessageId) -> Result<AckOutcome> {
        self.check_outage("ack")?;
        let outcome = {
            let mut rows = self.rows.lock();
            match rows.get_mut(id) {
                Some(message) if message.queue_name == queue_name => match message.state {
                    MessageState::Consumed => {
                        message.state = MessageState::Done;
                        AckOutcome::Acked
                    }
                    MessageState::Done => AckOutcome::AlreadyDone,
                    MessageState::Queued => AckOutcome::NotInFlight,
                },
                _ => AckOutcome::NotInFlight,
            }
        };

        if outcome == AckOutcome::Acked {
            self.announce(
                &self.channels.ack(queue_name),
                BrokerEvent::acked(queue_name, id.clone()),
            )
            .await?;
        }
        Ok(outcome)
    }

    async fn claimable_ids(&self, queue_name: &str, limit: i64) -> Result<Vec<MessageId>> {
        self.check_outage("claimable_ids")?;
        let now = Utc::now();
        let rows = self.rows.lock();

        let mut claimable: Vec<&Message> = rows
            .values()
            .filter(|m| {
                m.queue_name == queue_name
                    && m.state == MessageState::Queued
                    && m.is_available_at(now)
            })
            .collect();
        claimable.sort_by(|a, b| (a.enqueued_at, &a.id).cmp(&(b.enqueued_at, &b.id)));

        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(claimable
            .into_iter()
            .take(limit)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn requeue_stale(&self, queue_name: &str, older_than: Duration) -> Result<u64> {
        self.check_outage("requeue_stale")?;
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d));

        let requeued: Vec<MessageId> = {
            let mut rows = self.rows.lock();
            rows.values_mut()
                .filter(|m| m.queue_name == queue_name && m.state == MessageState::Consumed)
                .filter(|m| matches!((m.claimed_at, cutoff), (Some(at), Some(cut)) if at < cut))
                .map(|m| {
                    m.state = MessageState::Queued;
                    m.claimed_at = None;
                    m.available_at = now;
                    m.id.clone()
                })
                .collect()
        };

        let channel = self.channels.enqueue(queue_name);
        for id in &requeued {
            self.announce(&channel, BrokerEvent::enqueued(queue_name, id.clone()))
                .await?;
        }
        Ok(requeued.len() as u64)
    }

    async fn depth(&self, queue_name: &str) -> Result<QueueDepth> {
        self.check_outage("depth")?;
        let rows = self.rows.lock();
        let mut depth = QueueDepth::default();
        for message in rows.values().filter(|m| m.queue_name == queue_name) {
            match message.state {
                MessageState::Queued => depth.queued += 1,
                MessageState::Consumed => depth.consumed += 1,
                MessageState::Done => depth.done += 1,
            }
        }
        Ok(depth)
    }
}
