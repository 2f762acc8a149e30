//! Consumer counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the consumer loop
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub notifications_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub claims_won: AtomicU64,
    pub claims_lost: AtomicU64,
    pub transient_errors: AtomicU64,
    pub heartbeats: AtomicU64,
    pub sweeps: AtomicU64,
    pub reconnects: AtomicU64,
    pub acks: AtomicU64,
    pub abandoned: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStatsSnapshot {
    pub notifications_received: u64,
    pub parse_errors: u64,
    pub claims_won: u64,
    pub claims_lost: u64,
    pub transient_errors: u64,
    pub heartbeats: u64,
    pub sweeps: u64,
    pub reconnects: u64,
    pub acks: u64,
    pub abandoned: u64,
}

impl ConsumerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ConsumerStatsSnapshot {
            notifications_received: load(&self.notifications_received),
            parse_errors: load(&self.parse_errors),
            claims_won: load(&self.claims_won),
            claims_lost: load(&self.claims_lost),
            transient_errors: load(&self.transient_errors),
            heartbeats: load(&self.heartbeats),
            sweeps: load(&self.sweeps),
            reconnects: load(&self.reconnects),
            acks: load(&self.acks),
            abandoned: load(&self.abandoned),
        }
    }
}
