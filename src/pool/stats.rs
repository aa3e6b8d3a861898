//! Pool statistics
//!
//! Gauges are republished from inside the pool lock after every state change;
//! counters are bumped where the event happens. Reading a [`PoolStats`]
//! snapshot never takes the pool lock, so values read together may be
//! momentarily inconsistent with each other.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time view of the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections available for borrowing
    pub idle: usize,
    /// Connections checked out to callers
    pub busy: usize,
    /// Slots reserved for connections being created, validated or handed over
    pub pending: usize,
    /// Borrowers blocked waiting for capacity
    pub waiting: usize,
    /// Configured capacity
    pub max_active: usize,
    /// Physical connections opened
    pub created: u64,
    /// Physical connections closed
    pub destroyed: u64,
    /// Successful borrows
    pub borrowed: u64,
    /// Releases that reached the pool
    pub returned: u64,
    /// Validations that failed (borrow, return or idle)
    pub validation_failures: u64,
    /// Factory failures while opening connections
    pub create_failures: u64,
    /// Idle connections evicted for age
    pub evicted: u64,
    /// Busy connections reclaimed as abandoned
    pub abandoned: u64,
    /// Borrows that gave up waiting
    pub timeouts: u64,
}

impl PoolStats {
    /// Physical connections accounted for (idle + busy + pending)
    pub fn total(&self) -> usize {
        self.idle + self.busy + self.pending
    }

    /// Busy connections as a percentage of capacity
    pub fn utilization(&self) -> f64 {
        if self.max_active == 0 {
            return 0.0;
        }
        (self.busy as f64 / self.max_active as f64) * 100.0
    }
}

/// Atomic backing store for [`PoolStats`]
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    idle: AtomicUsize,
    busy: AtomicUsize,
    pending: AtomicUsize,
    waiting: AtomicUsize,
    pub(crate) created: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) borrowed: AtomicU64,
    pub(crate) returned: AtomicU64,
    pub(crate) validation_failures: AtomicU64,
    pub(crate) create_failures: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) abandoned: AtomicU64,
    pub(crate) timeouts: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn publish(&self, idle: usize, busy: usize, pending: usize, waiting: usize) {
        self.idle.store(idle, Ordering::Relaxed);
        self.busy.store(busy, Ordering::Relaxed);
        self.pending.store(pending, Ordering::Relaxed);
        self.waiting.store(waiting, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, max_active: usize) -> PoolStats {
        PoolStats {
            idle: self.idle.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            max_active,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            borrowed: self.borrowed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
