//! Consumer protocol tests against the in-memory backends
//!
//! Covers delivery, mutual exclusion between consumers, upsert semantics and
//! recovery from lost notifications, storage outages and dropped connections.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{flaky_broker, flaky_broker_with, within, TestBroker};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use pgbroker::test_utils::fast_test_config;
use pgbroker::{
    AckOutcome, BrokerError, ConsumerState, MessageId, MessageState, Notifier, QueueTable,
};
use tokio_test::{assert_err, assert_ok};

const QUIET: Duration = Duration::from_millis(150);

#[tokio::test]
async fn test_enqueued_message_is_delivered_once_and_acked() {
    let t = TestBroker::new();
    let mut first = t.broker.consume("jobs").await.unwrap();
    let mut second = t.broker.consume("jobs").await.unwrap();

    t.broker.enqueue("jobs", 42u64, b"hello".to_vec()).await.unwrap();

    let mut delivery = within(first.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "42");
    assert_eq!(delivery.body(), b"hello");
    assert_eq!(delivery.message().state, MessageState::Consumed);
    assert_eq!(assert_ok!(delivery.ack().await), AckOutcome::Acked);
    drop(delivery);

    let stored = t.table.fetch(&MessageId::from(42u64)).await.unwrap().unwrap();
    assert_eq!(stored.state, MessageState::Done);

    // the other consumer only ever sees heartbeats
    assert_err!(tokio::time::timeout(QUIET, second.next()).await);
    assert_eq!(second.stats().claims_won, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_consumers_race_for_one_message() {
    let t = TestBroker::new();
    let consumers = vec![
        t.broker.consume("jobs").await.unwrap(),
        t.broker.consume("jobs").await.unwrap(),
    ];

    let tasks: Vec<_> = consumers
        .into_iter()
        .map(|mut consumer| {
            tokio::spawn(async move {
                match tokio::time::timeout(Duration::from_millis(500), consumer.next()).await {
                    Ok(Ok(Some(mut delivery))) => {
                        assert_eq!(delivery.id().as_str(), "7");
                        delivery.ack().await.unwrap();
                        true
                    }
                    _ => false,
                }
            })
        })
        .collect();

    t.broker.enqueue("jobs", 7u64, b"work".to_vec()).await.unwrap();

    let winners = join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_a_single_winner() {
    let t = TestBroker::new();
    t.broker.enqueue("jobs", "contended", b"x".to_vec()).await.unwrap();

    let id = MessageId::new("contended");
    let attempts = (0..16).map(|_| {
        let table = t.table.clone();
        let id = id.clone();
        tokio::spawn(async move { table.try_claim("jobs", &id).await.unwrap().is_some() })
    });

    let wins = join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);

    // repeated claims on consumed and done rows stay false
    assert!(t.table.try_claim("jobs", &id).await.unwrap().is_none());
    assert_eq!(t.table.ack("jobs", &id).await.unwrap(), AckOutcome::Acked);
    assert!(t.table.try_claim("jobs", &id).await.unwrap().is_none());
    assert_eq!(t.table.ack("jobs", &id).await.unwrap(), AckOutcome::AlreadyDone);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_message_is_delivered_exactly_once_across_consumers() {
    let t = TestBroker::new();
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let mut consumer = t.broker.consume("jobs").await.unwrap();
        let received = Arc::clone(&received);
        tasks.push(tokio::spawn(async move {
            while let Ok(Ok(Some(mut delivery))) =
                tokio::time::timeout(Duration::from_millis(300), consumer.next()).await
            {
                received.lock().push(delivery.id().clone());
                delivery.ack().await.unwrap();
            }
        }));
    }

    for i in 0..50u64 {
        t.broker.enqueue("jobs", i, format!("body-{i}")).await.unwrap();
    }
    for task in join_all(tasks).await {
        task.unwrap();
    }

    let received = received.lock();
    let unique: HashSet<_> = received.iter().collect();
    assert_eq!(received.len(), 50);
    assert_eq!(unique.len(), 50);

    let depth = t.broker.depth("jobs").await.unwrap();
    assert_eq!(depth.done, 50);
    assert_eq!(depth.queued + depth.consumed, 0);
}

#[tokio::test]
async fn test_re_enqueue_resets_a_done_message() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();

    t.broker.enqueue("jobs", "retry-me", b"v1".to_vec()).await.unwrap();
    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    delivery.ack().await.unwrap();
    drop(delivery);

    t.broker.enqueue("jobs", "retry-me", b"v2".to_vec()).await.unwrap();
    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "retry-me");
    assert_eq!(delivery.body(), b"v2");
    assert_eq!(delivery.ack().await.unwrap(), AckOutcome::Acked);
    assert_eq!(delivery.ack().await.unwrap(), AckOutcome::AlreadyDone);
}

#[tokio::test]
async fn test_dropped_delivery_is_abandoned() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    t.broker.enqueue("jobs", "abandon", b"x".to_vec()).await.unwrap();

    let delivery = within(consumer.next()).await.unwrap().unwrap();
    delivery.abandon();

    assert_eq!(consumer.state(), ConsumerState::Idle);
    assert_eq!(consumer.stats().abandoned, 1);
    assert_eq!(t.broker.depth("jobs").await.unwrap().consumed, 1);
    assert_err!(tokio::time::timeout(QUIET, consumer.next()).await);
}

#[tokio::test]
async fn test_lost_notification_is_recovered_by_idle_sweep() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    // finish the startup sweep on an empty queue
    let _ = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;

    t.notifier.set_dropping(true);
    t.broker.enqueue("jobs", "silent", b"x".to_vec()).await.unwrap();

    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "silent");
    delivery.ack().await.unwrap();
    drop(delivery);

    let stats = consumer.stats();
    assert_eq!(stats.notifications_received, 0);
    assert!(stats.heartbeats >= 1);
    assert!(stats.sweeps >= 2);
}

#[tokio::test]
async fn test_messages_enqueued_before_subscribing_are_swept() {
    let t = TestBroker::new();
    t.broker.enqueue("jobs", "early", b"x".to_vec()).await.unwrap();

    let mut consumer = t.broker.consume("jobs").await.unwrap();
    let delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "early");
}

#[tokio::test]
async fn test_transient_claim_error_is_skipped() {
    let mut config = fast_test_config();
    config.consumer.sweep_on_idle = false;
    let t = TestBroker::with_config(config);
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    let _ = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;

    t.broker.enqueue("jobs", "flaky", b"x".to_vec()).await.unwrap();
    t.table.inject_outage(1);
    assert_err!(tokio::time::timeout(QUIET, consumer.next()).await);
    assert_eq!(consumer.stats().transient_errors, 1);

    // the message is still queued; announcing it again gets it delivered
    t.broker.enqueue("jobs", "flaky", b"x".to_vec()).await.unwrap();
    let delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "flaky");
    drop(delivery);
    assert_eq!(consumer.stats().claims_won, 1);
}

#[tokio::test]
async fn test_claim_delivers_without_a_separate_read() {
    let (broker, table, _) = flaky_broker();
    let mut consumer = broker.consume("jobs").await.unwrap();
    broker.enqueue("jobs", "read-fails", b"payload".to_vec()).await.unwrap();

    table.fail_fetches(1);
    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "read-fails");
    assert_eq!(delivery.body(), b"payload");
    assert_eq!(delivery.message().state, MessageState::Consumed);
    assert_eq!(delivery.ack().await.unwrap(), AckOutcome::Acked);
    drop(delivery);

    // the armed read failure was never hit by the consumer
    assert!(table.fetch(&MessageId::new("read-fails")).await.unwrap_err().is_transient());
    let depth = broker.depth("jobs").await.unwrap();
    assert_eq!(depth.done, 1);
    assert_eq!(depth.consumed, 0);
}

#[tokio::test]
async fn test_dropping_next_before_the_claim_keeps_the_message() {
    let mut config = fast_test_config();
    config.consumer.sweep_on_idle = false;
    let (broker, table, _) = flaky_broker_with(config);

    // enqueued before subscribing, so only the startup sweep ever sees it
    broker.enqueue("jobs", "cancelled", b"x".to_vec()).await.unwrap();
    let mut consumer = broker.consume("jobs").await.unwrap();

    // the first poll sweeps the candidate in and suspends inside the claim
    table.pause_claims(true);
    assert!(consumer.next().now_or_never().is_none());

    let depth = broker.depth("jobs").await.unwrap();
    assert_eq!(depth.queued, 1);
    assert_eq!(depth.consumed, 0);
    assert_eq!(consumer.stats().claims_won, 0);

    table.pause_claims(false);
    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "cancelled");
    delivery.ack().await.unwrap();
    drop(delivery);
    assert_eq!(consumer.stats().sweeps, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_channel_still_sweeps_for_lost_messages() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    t.broker.enqueue("jobs", "first", b"x".to_vec()).await.unwrap();
    within(consumer.next()).await.unwrap().unwrap().ack().await.unwrap();

    t.notifier.set_dropping(true);
    t.broker.enqueue("jobs", "silent", b"x".to_vec()).await.unwrap();
    t.notifier.set_dropping(false);

    // keep the channel busy so polls never time out
    let notifier = t.notifier.clone();
    let noise = tokio::spawn(async move {
        loop {
            let _ = notifier.notify("jobs.enqueue", "noise").await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "silent");
    delivery.ack().await.unwrap();
    drop(delivery);
    noise.abort();

    assert!(consumer.stats().parse_errors > 0);
    assert!(consumer.stats().sweeps >= 2);
}

#[tokio::test]
async fn test_transient_ack_error_can_be_retried() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    t.broker.enqueue("jobs", "ack-retry", b"x".to_vec()).await.unwrap();

    let mut delivery = within(consumer.next()).await.unwrap().unwrap();
    t.table.inject_outage(1);
    let err = assert_err!(delivery.ack().await);
    assert!(err.is_transient());
    assert!(!delivery.is_settled());

    assert_eq!(delivery.ack().await.unwrap(), AckOutcome::Acked);
    assert!(delivery.is_settled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumer_reconnects_after_connection_loss() {
    let mut config = fast_test_config();
    config.consumer.sweep_on_idle = false;
    let t = TestBroker::with_config(config);
    let mut consumer = t.broker.consume("jobs").await.unwrap();

    let task = tokio::spawn(async move {
        let id = {
            let mut delivery = within(consumer.next()).await.unwrap().unwrap();
            delivery.ack().await.unwrap();
            delivery.id().clone()
        };
        (id, consumer.stats())
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    t.notifier.sever_connections();

    within(async {
        while t.notifier.subscriber_count("jobs.enqueue") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    t.broker.enqueue("jobs", "after-reconnect", b"x".to_vec()).await.unwrap();

    let (id, stats) = task.await.unwrap();
    assert_eq!(id, MessageId::new("after-reconnect"));
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn test_reconnect_exhaustion_is_surfaced() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    let _ = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;

    t.notifier.set_accepting(false);
    t.notifier.sever_connections();

    match within(consumer.next()).await {
        Err(BrokerError::ReconnectExhausted { channel, attempts }) => {
            assert_eq!(channel, "jobs.enqueue");
            assert_eq!(attempts, 5);
        }
        other => panic!("expected ReconnectExhausted, got {:?}", other.map(|d| d.is_some())),
    };
}

#[tokio::test]
async fn test_close_handle_unblocks_pending_next() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    let handle = consumer.close_handle();

    let task = tokio::spawn(async move {
        let finished = within(consumer.next()).await.unwrap().is_none();
        (finished, consumer.state())
    });

    tokio::time::sleep(Duration::from_millis(40)).await;
    handle.close();
    assert!(handle.is_closed());

    let (finished, state) = task.await.unwrap();
    assert!(finished);
    assert_eq!(state, ConsumerState::Closed);
    assert_eq!(t.notifier.subscriber_count("jobs.enqueue"), 0);
}

#[tokio::test]
async fn test_delayed_message_waits_for_availability() {
    let t = TestBroker::new();
    let mut consumer = t.broker.consume("jobs").await.unwrap();
    t.broker
        .producer()
        .enqueue_delayed("jobs", "later", b"x".to_vec(), Duration::from_millis(300))
        .await
        .unwrap();

    assert_err!(tokio::time::timeout(Duration::from_millis(100), consumer.next()).await);

    let delivery = within(consumer.next()).await.unwrap().unwrap();
    assert_eq!(delivery.id().as_str(), "later");
    assert!(delivery.message().available_at > delivery.message().enqueued_at);
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let t = TestBroker::new();
    let mut billing = t.broker.consume("billing").await.unwrap();
    t.broker.enqueue("jobs", "j1", b"x".to_vec()).await.unwrap();

    assert_err!(tokio::time::timeout(QUIET, billing.next()).await);
    assert_eq!(t.broker.depth("jobs").await.unwrap().queued, 1);
}
