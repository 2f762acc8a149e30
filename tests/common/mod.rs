//! Shared helpers for broker integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pgbroker::test_utils::fast_test_config;
use pgbroker::{
    AckOutcome, Broker, BrokerConfig, BrokerError, ChannelNames, InMemoryNotifier,
    InMemoryQueueTable, Message, MessageId, QueueDepth, QueueTable, Result,
};

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory broker with direct access to the backends for failure injection
#[derive(Debug)]
pub struct TestBroker {
    pub broker: Broker,
    pub table: Arc<InMemoryQueueTable>,
    pub notifier: InMemoryNotifier,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::with_config(fast_test_config())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let notifier = InMemoryNotifier::new();
        let table = Arc::new(InMemoryQueueTable::new(
            Arc::new(notifier.clone()),
            ChannelNames::from_config(&config.channels),
            config.channels.max_payload_size,
        ));
        let broker = Broker::with_backends(table.clone(), Arc::new(notifier.clone()), config)
            .expect("test config should be valid");

        Self {
            broker,
            table,
            notifier,
        }
    }
}

/// In-memory table that can fail reads and suspend claims on demand
#[derive(Debug)]
pub struct FlakyTable {
    pub inner: Arc<InMemoryQueueTable>,
    fetch_failures: AtomicU32,
    pause_claims: AtomicBool,
}

impl FlakyTable {
    pub fn new(inner: Arc<InMemoryQueueTable>) -> Self {
        Self {
            inner,
            fetch_failures: AtomicU32::new(0),
            pause_claims: AtomicBool::new(false),
        }
    }

    /// Fail the next `count` fetches with a transient error
    pub fn fail_fetches(&self, count: u32) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Yield to the scheduler once before every claim reaches the table
    pub fn pause_claims(&self, pause: bool) {
        self.pause_claims.store(pause, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueTable for FlakyTable {
    async fn upsert(&self, message: &Message) -> Result<()> {
        self.inner.upsert(message).await
    }

    async fn try_claim(&self, queue_name: &str, id: &MessageId) -> Result<Option<Message>> {
        if self.pause_claims.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.inner.try_claim(queue_name, id).await
    }

    async fn fetch(&self, id: &MessageId) -> Result<Option<Message>> {
        let failing = self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::unavailable("fetch", "connection reset"));
        }
        self.inner.fetch(id).await
    }

    async fn ack(&self, queue_name: &str, id: &MessageId) -> Result<AckOutcome> {
        self.inner.ack(queue_name, id).await
    }

    async fn claimable_ids(&self, queue_name: &str, limit: i64) -> Result<Vec<MessageId>> {
        self.inner.claimable_ids(queue_name, limit).await
    }

    async fn requeue_stale(&self, queue_name: &str, older_than: Duration) -> Result<u64> {
        self.inner.requeue_stale(queue_name, older_than).await
    }

    async fn depth(&self, queue_name: &str) -> Result<QueueDepth> {
        self.inner.depth(queue_name).await
    }
}

/// Broker over a [`FlakyTable`]
pub fn flaky_broker() -> (Broker, Arc<FlakyTable>, InMemoryNotifier) {
    flaky_broker_with(fast_test_config())
}

pub fn flaky_broker_with(config: BrokerConfig) -> (Broker, Arc<FlakyTable>, InMemoryNotifier) {
    let notifier = InMemoryNotifier::new();
    let inner = Arc::new(InMemoryQueueTable::new(
        Arc::new(notifier.clone()),
        ChannelNames::from_config(&config.channels),
        config.channels.max_payload_size,
    ));
    let table = Arc::new(FlakyTable::new(inner));
    let broker = Broker::with_backends(table.clone(), Arc::new(notifier.clone()), config)
        .expect("test config should be valid");
    (broker, table, notifier)
}

/// Run `future`, failing the test if it does not finish within [`TEST_TIMEOUT`]
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation timed out")
}
