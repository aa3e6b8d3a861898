//! Shared test utilities and fixtures for the connpool test suite.
//!
//! This module provides:
//! - Pool constructors wired to the in-memory factory
//! - A mock clock for driving eviction and abandonment
//! - Async polling helpers for waiting on pool state
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use connpool::clock::MockClock;
use connpool::testing::MemoryFactory;
use connpool::{ConnectionPool, PoolConfig, PoolStats};

// ============================================================================
// Pool Fixtures
// ============================================================================

/// A pool over a fresh in-memory factory; the returned factory shares state
pub fn memory_pool(config: PoolConfig) -> (ConnectionPool<MemoryFactory>, MemoryFactory) {
    let factory = MemoryFactory::new();
    let pool = ConnectionPool::new(factory.clone(), config).expect("valid test config");
    (pool, factory)
}

/// Like [`memory_pool`] with a manually advanced clock
pub fn mock_clock_pool(
    config: PoolConfig,
) -> (ConnectionPool<MemoryFactory>, MemoryFactory, Arc<MockClock>) {
    let factory = MemoryFactory::new();
    let clock = Arc::new(MockClock::new());
    let pool = ConnectionPool::with_clock(factory.clone(), config, clock.clone())
        .expect("valid test config");
    (pool, factory, clock)
}

/// Small pool config with a short borrow timeout
pub fn small_config(max_active: usize) -> PoolConfig {
    PoolConfig::default()
        .with_max_active(max_active)
        .with_max_idle(max_active)
        .with_max_wait(Some(Duration::from_secs(5)))
}

// ============================================================================
// Async Helpers
// ============================================================================

/// Poll `stats()` until `predicate` holds, panicking after two seconds
pub async fn wait_for_stats<F>(pool: &ConnectionPool<MemoryFactory>, predicate: F) -> PoolStats
where
    F: Fn(&PoolStats) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stats = pool.stats();
        if predicate(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool never reached expected state: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Wait until exactly `n` borrowers are queued
pub async fn wait_for_waiters(pool: &ConnectionPool<MemoryFactory>, n: usize) {
    wait_for_stats(pool, |s| s.waiting == n).await;
}

// ============================================================================
// Assertions
// ============================================================================

/// `idle + busy + pending <= max_active`
pub fn assert_within_capacity(stats: &PoolStats) {
    assert!(
        stats.total() <= stats.max_active,
        "capacity exceeded: {stats:?}"
    );
}
