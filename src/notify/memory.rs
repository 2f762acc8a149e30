//! In-process notifier
//!
//! Delivers notifications between tasks of one process. Failure injection
//! helpers let tests drop notifications, sever listening connections and
//! refuse new ones, which is how the consumer's recovery paths are exercised
//! without a database.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Notification, Notifier, PollOutcome, Subscription};
use crate::error::{BrokerError, Result};

#[derive(Debug)]
struct Hub {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Notification>>>,
    accepting: AtomicBool,
    dropping: AtomicBool,
}

/// Process-local publish/subscribe hub
///
/// Cloning yields another handle to the same hub.
#[derive(Debug, Clone)]
pub struct InMemoryNotifier {
    hub: Arc<Hub>,
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                subscribers: DashMap::new(),
                accepting: AtomicBool::new(true),
                dropping: AtomicBool::new(false),
            }),
        }
    }

    /// Close every open subscription; their next poll reports a lost connection
    pub fn sever_connections(&self) {
        self.hub.subscribers.clear();
        warn!("Severed all in-memory notification connections");
    }

    /// Close the subscriptions of one channel
    pub fn sever_channel(&self, channel: &str) {
        self.hub.subscribers.remove(channel);
    }

    /// When false, `listen` fails as if the database were unreachable
    pub fn set_accepting(&self, accepting: bool) {
        self.hub.accepting.store(accepting, Ordering::SeqCst);
    }

    /// When true, `notify` silently discards every notification
    pub fn set_dropping(&self, dropping: bool) {
        self.hub.dropping.store(dropping, Ordering::SeqCst);
    }

    /// Number of live subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .subscribers
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn listen(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        if !self.hub.accepting.load(Ordering::SeqCst) {
            return Err(BrokerError::unavailable(
                "listen",
                format!("notifier refused connection for channel {channel}"),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.hub
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(sender);

        debug!(channel = %channel, "Registered in-memory subscription");
        Ok(Box::new(InMemorySubscription {
            channel: channel.to_string(),
            receiver,
        }))
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        if self.hub.dropping.load(Ordering::SeqCst) {
            debug!(channel = %channel, "Dropping notification");
            return Ok(());
        }

        if let Some(mut senders) = self.hub.subscribers.get_mut(channel) {
            let notification = Notification::new(channel, payload);
            senders.retain(|sender| sender.send(notification.clone()).is_ok());
        }
        Ok(())
    }
}

/// Receiving end of an in-memory subscription
#[derive(Debug)]
pub struct InMemorySubscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome> {
        let first = match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Err(_elapsed) => return Ok(PollOutcome::Idle),
            Ok(None) => return Ok(PollOutcome::ConnectionLost),
            Ok(Some(notification)) => notification,
        };

        let mut batch = vec![first];
        while let Ok(notification) = self.receiver.try_recv() {
            batch.push(notification);
        }
        Ok(PollOutcome::Notifications(batch))
    }
}
