//! # Consumer
//!
//! Notification-driven consumer for one queue. Each consumer owns a dedicated
//! subscription to `{queue}.enqueue` and runs the claim protocol:
//!
//! ```text
//! Idle -> Draining -> Claiming -> Delivered -> Idle
//!   ^                    |
//!   +---- lost race -----+
//! ```
//!
//! Notifications only say "look at this id". The consumer never trusts them:
//! it attempts a conditional claim on the table and only the single winner of
//! that update receives the message. Lost or duplicated notifications are
//! harmless because the table is swept for claimable rows at startup, on idle
//! heartbeats, after every reconnect, and whenever the last sweep is older than
//! the poll timeout.
//!
//! A [`Delivery`] mutably borrows its consumer, so the next message can only be
//! requested after the current one is acked or dropped.

pub mod delivery;
pub mod stats;

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::error::{BrokerError, Result};
use crate::messaging::{BrokerEvent, ChannelNames, MessageId};
use crate::notify::{Notification, Notifier, PollOutcome, Subscription};
use crate::storage::QueueTable;

pub use delivery::Delivery;
pub use stats::{ConsumerStats, ConsumerStatsSnapshot};

/// Where the consumer is in its protocol loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Waiting on the subscription
    Idle,
    /// Working through candidates buffered by an earlier poll or sweep
    Draining,
    /// Attempting the conditional claim
    Claiming,
    /// A delivery is outstanding
    Delivered,
    /// Closed; `next` returns `None`
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Claiming => "claiming",
            Self::Delivered => "delivered",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable handle that closes a consumer from another task
#[derive(Debug, Clone)]
pub struct CloseHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Wake any pending `next` and make it return `Ok(None)`
    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }
}

enum Wake {
    Closed,
    Polled(PollOutcome),
}

/// Resolves once the close flag is set
async fn closed(receiver: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *receiver.borrow_and_update();
        if is_closed {
            return;
        }
        if receiver.changed().await.is_err() {
            // sender gone: nobody can close us any more
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `delay`, returning early with `true` if closed meanwhile
async fn sleep_or_closed(mut close_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = closed(&mut close_rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Consumer of one queue
#[derive(Debug)]
pub struct Consumer {
    id: Uuid,
    queue_name: String,
    channel: String,
    table: Arc<dyn QueueTable>,
    notifier: Arc<dyn Notifier>,
    config: ConsumerConfig,
    subscription: Option<Box<dyn Subscription>>,
    backlog: VecDeque<MessageId>,
    backlog_ids: HashSet<MessageId>,
    needs_sweep: bool,
    last_sweep: Instant,
    state: ConsumerState,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    /// Subscribe to a queue's enqueue channel
    ///
    /// The subscription is open when this returns, so any message enqueued
    /// afterwards is announced to this consumer. Messages already waiting are
    /// picked up by the startup sweep.
    pub async fn subscribe(
        queue_name: impl Into<String>,
        table: Arc<dyn QueueTable>,
        notifier: Arc<dyn Notifier>,
        channels: &ChannelNames,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let queue_name = queue_name.into();
        channels.validate_queue(&queue_name)?;
        let channel = channels.enqueue(&queue_name);

        let subscription = notifier.listen(&channel).await?;
        let (close_tx, close_rx) = watch::channel(false);
        let id = Uuid::new_v4();

        info!(consumer_id = %id, queue = %queue_name, channel = %channel, "Consumer subscribed");
        Ok(Self {
            id,
            queue_name,
            channel,
            table,
            notifier,
            config,
            subscription: Some(subscription),
            backlog: VecDeque::new(),
            backlog_ids: HashSet::new(),
            needs_sweep: true,
            last_sweep: Instant::now(),
            state: ConsumerState::Idle,
            close_tx: Arc::new(close_tx),
            close_rx,
            stats: Arc::new(ConsumerStats::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            sender: Arc::clone(&self.close_tx),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Close the consumer and release its subscription
    pub fn close(&mut self) {
        self.close_tx.send_replace(true);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state != ConsumerState::Closed {
            info!(consumer_id = %self.id, queue = %self.queue_name, "Consumer closed");
        }
        self.subscription = None;
        self.backlog.clear();
        self.backlog_ids.clear();
        self.state = ConsumerState::Closed;
    }

    /// Wait for the next message claimed by this consumer
    ///
    /// Returns `Ok(None)` once the consumer is closed. Errors are returned for
    /// non-transient storage failures and when the subscription cannot be
    /// re-established.
    ///
    /// # Cancel safety
    ///
    /// A won claim is turned into a [`Delivery`] without another await, so
    /// dropping this future while it waits for notifications, sweeps, or
    /// reconnects loses no message. A candidate leaves the backlog only once
    /// its claim has resolved, so a call dropped mid-claim retries it next
    /// time. Only cancelling the claim statement itself after the database
    /// applied it can leave a row `consumed` with no delivery; such rows need
    /// a [`Reaper`].
    /// For shutdown prefer [`CloseHandle::close`], which makes a pending call
    /// return `Ok(None)` instead of being dropped.
    ///
    /// [`Reaper`]: crate::reaper::Reaper
    pub async fn next(&mut self) -> Result<Option<Delivery<'_>>> {
        loop {
            if self.is_closed() {
                self.shutdown();
                return Ok(None);
            }

            if self.sweep_due() {
                self.sweep().await?;
            }

            let candidate = match self.backlog.front() {
                Some(id) => {
                    self.state = ConsumerState::Draining;
                    id.clone()
                }
                None => {
                    self.state = ConsumerState::Idle;
                    match self.wait_for_notifications().await? {
                        Wake::Closed => {}
                        Wake::Polled(PollOutcome::Notifications(batch)) => self.ingest(batch),
                        Wake::Polled(PollOutcome::Idle) => {
                            ConsumerStats::incr(&self.stats.heartbeats);
                            debug!(queue = %self.queue_name, "Idle heartbeat");
                            self.needs_sweep = self.config.sweep_on_idle;
                        }
                        Wake::Polled(PollOutcome::ConnectionLost) => self.reconnect().await?,
                    }
                    continue;
                }
            };

            self.state = ConsumerState::Claiming;
            let claim = self.table.try_claim(&self.queue_name, &candidate).await;
            self.backlog.pop_front();
            self.backlog_ids.remove(&candidate);

            let message = match claim {
                Ok(Some(message)) => {
                    ConsumerStats::incr(&self.stats.claims_won);
                    message
                }
                Ok(None) => {
                    ConsumerStats::incr(&self.stats.claims_lost);
                    debug!(message_id = %candidate, "Claim lost to another consumer");
                    continue;
                }
                Err(e) if e.is_transient() => {
                    ConsumerStats::incr(&self.stats.transient_errors);
                    warn!(message_id = %candidate, error = %e, "Transient error while claiming, skipping");
                    continue;
                }
                Err(e) => {
                    self.state = ConsumerState::Idle;
                    return Err(e);
                }
            };

            debug!(
                consumer_id = %self.id,
                message_id = %message.id,
                "Delivering message"
            );
            self.state = ConsumerState::Delivered;
            return Ok(Some(Delivery::new(self, message)));
        }
    }

    async fn wait_for_notifications(&mut self) -> Result<Wake> {
        let timeout = self.config.poll_timeout();
        let mut close_rx = self.close_rx.clone();
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(Wake::Polled(PollOutcome::ConnectionLost));
        };

        tokio::select! {
            biased;
            _ = closed(&mut close_rx) => Ok(Wake::Closed),
            outcome = subscription.poll(timeout) => outcome.map(Wake::Polled),
        }
    }

    /// Buffer candidate ids from a batch of notifications
    fn ingest(&mut self, batch: Vec<Notification>) {
        ConsumerStats::add(&self.stats.notifications_received, batch.len() as u64);

        for notification in batch {
            let event = match BrokerEvent::from_payload(&notification.payload) {
                Ok(event) => event,
                Err(e) => {
                    ConsumerStats::incr(&self.stats.parse_errors);
                    warn!(
                        channel = %notification.channel,
                        payload = %notification.payload,
                        error = %e,
                        "Ignoring malformed notification"
                    );
                    continue;
                }
            };

            match event {
                BrokerEvent::Enqueued(ref e) if e.queue_name == self.queue_name => {
                    self.push_candidate(e.message_id.clone());
                }
                other => debug!(event = ?other, "Ignoring notification for another queue or event"),
            }
        }
    }

    fn push_candidate(&mut self, id: MessageId) {
        if self.backlog_ids.insert(id.clone()) {
            self.backlog.push_back(id);
        }
    }

    /// A sweep is owed after startup, idle heartbeats and reconnects, and
    /// periodically on queues that are never idle
    fn sweep_due(&self) -> bool {
        self.needs_sweep
            || (self.config.sweep_on_idle && self.last_sweep.elapsed() >= self.config.poll_timeout())
    }

    /// Scan the table for claimable rows whose notification may have been lost
    async fn sweep(&mut self) -> Result<()> {
        self.needs_sweep = false;
        self.last_sweep = Instant::now();
        ConsumerStats::incr(&self.stats.sweeps);

        match self
            .table
            .claimable_ids(&self.queue_name, self.config.sweep_batch_size)
            .await
        {
            Ok(ids) => {
                if !ids.is_empty() {
                    debug!(queue = %self.queue_name, count = ids.len(), "Sweep found claimable messages");
                }
                for id in ids {
                    self.push_candidate(id);
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                ConsumerStats::incr(&self.stats.transient_errors);
                warn!(queue = %self.queue_name, error = %e, "Transient error during sweep");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-establish the subscription with exponential backoff
    async fn reconnect(&mut self) -> Result<()> {
        self.subscription = None;
        let max_attempts = self.config.max_reconnect_attempts;
        warn!(channel = %self.channel, "Notification connection lost, reconnecting");

        for attempt in 1..=max_attempts {
            let delay = self.config.reconnect_delay(attempt);
            if sleep_or_closed(self.close_rx.clone(), delay).await {
                return Ok(());
            }

            match self.notifier.listen(&self.channel).await {
                Ok(subscription) => {
                    self.subscription = Some(subscription);
                    self.needs_sweep = true;
                    ConsumerStats::incr(&self.stats.reconnects);
                    info!(channel = %self.channel, attempt, "Notification connection re-established");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        channel = %self.channel,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }

        error!(channel = %self.channel, max_attempts, "Giving up on notification connection");
        Err(BrokerError::ReconnectExhausted {
            channel: self.channel.clone(),
            attempts: max_attempts,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Message;
    use crate::notify::InMemoryNotifier;
    use crate::storage::InMemoryQueueTable;

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout_ms: 20,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 5,
            reconnect_max_delay_ms: 20,
            ..ConsumerConfig::default()
        }
    }

    async fn setup() -> (Arc<InMemoryQueueTable>, InMemoryNotifier, Consumer) {
        let notifier = InMemoryNotifier::new();
        let table = Arc::new(InMemoryQueueTable::new(
            Arc::new(notifier.clone()),
            ChannelNames::default(),
            7800,
        ));
        let consumer = Consumer::subscribe(
            "jobs",
            table.clone(),
            Arc::new(notifier.clone()),
            &ChannelNames::default(),
            fast_config(),
        )
        .await
        .unwrap();
        (table, notifier, consumer)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConsumerState::Delivered.to_string(), "delivered");
        assert_eq!(ConsumerState::Idle.as_str(), "idle");
    }

    #[tokio::test]
    async fn test_rejects_invalid_queue() {
        let notifier = InMemoryNotifier::new();
        let table = Arc::new(InMemoryQueueTable::new(
            Arc::new(notifier.clone()),
            ChannelNames::default(),
            7800,
        ));
        let err = Consumer::subscribe(
            "bad queue",
            table,
            Arc::new(notifier),
            &ChannelNames::default(),
            fast_config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidQueueName { .. }));
    }

    #[tokio::test]
    async fn test_delivery_and_state() {
        let (table, _, mut consumer) = setup().await;
        table
            .upsert(&Message::queued("jobs", "1", "hello"))
            .await
            .unwrap();

        let mut delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), b"hello");
        delivery.ack().await.unwrap();
        drop(delivery);

        assert_eq!(consumer.state(), ConsumerState::Idle);
        let stats = consumer.stats();
        assert_eq!(stats.claims_won, 1);
        assert_eq!(stats.acks, 1);
    }

    #[tokio::test]
    async fn test_ingest_skips_malformed_and_deduplicates() {
        let (_, _, mut consumer) = setup().await;
        let enqueued = BrokerEvent::enqueued("jobs", MessageId::new("2"))
            .to_payload(7800)
            .unwrap();
        let acked = BrokerEvent::acked("jobs", MessageId::new("3"))
            .to_payload(7800)
            .unwrap();
        let foreign = BrokerEvent::enqueued("billing", MessageId::new("4"))
            .to_payload(7800)
            .unwrap();

        consumer.ingest(vec![
            Notification::new("jobs.enqueue", "garbage"),
            Notification::new("jobs.enqueue", enqueued.clone()),
            Notification::new("jobs.enqueue", enqueued),
            Notification::new("jobs.enqueue", acked),
            Notification::new("jobs.enqueue", foreign),
        ]);

        assert_eq!(consumer.backlog, VecDeque::from(vec![MessageId::new("2")]));
        let stats = consumer.stats();
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.notifications_received, 5);
    }

    #[tokio::test]
    async fn test_backlog_deduplicates_bursts() {
        let (_, _, mut consumer) = setup().await;
        for round in 0..3 {
            for i in 0..500 {
                consumer.push_candidate(MessageId::from(i as u64));
            }
            assert_eq!(consumer.backlog.len(), 500, "round {round}");
        }
        assert_eq!(consumer.backlog_ids.len(), 500);
        assert_eq!(consumer.backlog.front(), Some(&MessageId::from(0u64)));
    }

    #[tokio::test]
    async fn test_delivered_id_can_be_delivered_again() {
        let (table, _, mut consumer) = setup().await;
        for body in ["v1", "v2"] {
            table.upsert(&Message::queued("jobs", "again", body)).await.unwrap();
            let mut delivery = consumer.next().await.unwrap().unwrap();
            assert_eq!(delivery.message().body_str(), Some(body));
            delivery.ack().await.unwrap();
        }
        assert!(consumer.backlog_ids.is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_sequence() {
        let (_, notifier, mut consumer) = setup().await;
        consumer.close();
        assert!(consumer.next().await.unwrap().is_none());
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(notifier.subscriber_count("jobs.enqueue"), 0);
    }
}
