//! Integration tests for the connection pool.
//!
//! This module covers the borrow/release protocol end to end:
//! - Capacity limits and borrow timeouts
//! - Reuse, validation on borrow and return
//! - Abandonment reaping
//! - Shutdown and drain behaviour
//! - Waiter fairness and cancellation
//! - Cancelled release and close futures
//! - Lazy one-time initialisation

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use connpool::{ConnectionState, PoolConfig, PoolError};
use tokio::sync::mpsc;

// ============================================================================
// Capacity and Timeouts
// ============================================================================

mod capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_third_borrow_times_out_when_two_are_busy() {
        let config = PoolConfig::default()
            .with_max_active(2)
            .with_max_idle(2)
            .with_max_wait(Some(Duration::from_millis(100)));
        let (pool, factory) = memory_pool(config);

        let _a = pool.get_connection().await.unwrap();
        let _b = pool.get_connection().await.unwrap();

        let started = Instant::now();
        let err = pool.get_connection().await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            PoolError::PoolExhausted { waited } => assert!(waited >= Duration::from_millis(100)),
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(factory.opened(), 2);

        let stats = pool.stats();
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_borrow_timeout_override() {
        let (pool, _) = memory_pool(small_config(1));
        let _held = pool.get_connection().await.unwrap();

        let started = Instant::now();
        let err = pool
            .borrow_timeout(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unbounded_wait_is_served_on_release() {
        let (pool, _) = memory_pool(small_config(1));
        let pool = Arc::new(pool);
        let mut held = pool.get_connection().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow_timeout(None).await.map(|c| c.id()) })
        };
        wait_for_waiters(&pool, 1).await;

        let held_id = held.id();
        held.release().await;
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test]
    async fn test_capacity_holds_under_contention() {
        let (pool, factory) = memory_pool(small_config(3));
        let pool = Arc::new(pool);

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        let mut conn = pool.get_connection().await.unwrap();
                        assert_within_capacity(&pool.stats());
                        tokio::task::yield_now().await;
                        conn.release().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.borrowed, 240);
        assert_eq!(stats.returned, 240);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.pending, 0);
        assert!(factory.opened() <= 3);
    }
}

// ============================================================================
// Reuse and Validation
// ============================================================================

mod reuse_tests {
    use super::*;

    #[tokio::test]
    async fn test_single_connection_is_reused() {
        let (pool, factory) = memory_pool(small_config(1));

        let mut first = pool.get_connection().await.unwrap();
        let first_id = first.id();
        first.release().await;

        let started = Instant::now();
        let second = pool.get_connection().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(second.id(), first_id);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_borrow_validation_replaces_connection() {
        let config = small_config(2).with_test_on_borrow(true);
        let (pool, factory) = memory_pool(config);

        let mut conn = pool.get_connection().await.unwrap();
        let stale_id = conn.id();
        conn.release().await;
        assert_eq!(pool.stats().idle, 1);

        factory.set_fail_validation(true);
        let fresh = pool.get_connection().await.unwrap();

        assert_ne!(fresh.id(), stale_id);
        assert_eq!(factory.opened(), 2);
        assert_eq!(factory.closed(), 1);
        let stats = pool.stats();
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 1);
    }

    #[tokio::test]
    async fn test_failed_borrow_validation_at_capacity_reuses_slot() {
        let config = small_config(1).with_test_on_borrow(true);
        let (pool, factory) = memory_pool(config);

        let mut conn = pool.get_connection().await.unwrap();
        conn.release().await;

        factory.set_fail_validation(true);
        let fresh = pool.get_connection().await.unwrap();
        assert_eq!(fresh.id(), 2);
        assert_eq!(factory.live(), 1);
        assert_within_capacity(&pool.stats());
    }

    #[tokio::test]
    async fn test_failed_borrow_validation_surfaces_create_error() {
        let config = small_config(1).with_test_on_borrow(true);
        let (pool, factory) = memory_pool(config);

        let mut conn = pool.get_connection().await.unwrap();
        conn.release().await;

        factory.set_fail_validation(true);
        factory.set_fail_open(true);
        let err = pool.get_connection().await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionCreate { .. }));

        let stats = pool.stats();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.create_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_return_validation_discards() {
        let config = small_config(2).with_test_on_return(true);
        let (pool, factory) = memory_pool(config);

        let mut conn = pool.get_connection().await.unwrap();
        factory.set_fail_validation(true);
        conn.release().await;

        assert_eq!(factory.closed(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.validation_failures, 1);
    }

    #[tokio::test]
    async fn test_fatal_passthrough_error_discards_on_release() {
        let (pool, factory) = memory_pool(small_config(2));

        let mut conn = pool.get_connection().await.unwrap();
        conn.lock().await.unwrap().sever();
        let err = conn.passthrough(|c| c.query("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver { .. }));
        assert!(conn.is_broken());

        conn.release().await;
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_non_fatal_passthrough_error_keeps_connection() {
        let (pool, factory) = memory_pool(small_config(2));

        let mut conn = pool.get_connection().await.unwrap();
        let err = conn.passthrough(|c| c.query("BAD SQL")).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver { .. }));
        assert!(!conn.is_broken());

        conn.release().await;
        assert_eq!(factory.closed(), 0);
        assert_eq!(pool.stats().idle, 1);
    }
}

// ============================================================================
// Release Semantics
// ============================================================================

mod release_tests {
    use super::*;

    #[tokio::test]
    async fn test_double_release_is_idempotent() {
        let (pool, factory) = memory_pool(small_config(2));

        let mut conn = pool.get_connection().await.unwrap();
        conn.release().await;
        let after_first = pool.stats();
        conn.release().await;
        let after_second = pool.stats();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.returned, 1);
        assert_eq!(after_second.idle, 1);
        assert_eq!(factory.closed(), 0);
    }

    #[tokio::test]
    async fn test_released_handle_rejects_use() {
        let (pool, _) = memory_pool(small_config(1));

        let mut conn = pool.get_connection().await.unwrap();
        conn.release().await;

        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Discarded);
        let err = conn.passthrough(|c| c.query("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionClosed));
        assert!(!conn.native().await.is_available());
    }

    #[tokio::test]
    async fn test_dropped_handle_returns_to_pool() {
        let (pool, factory) = memory_pool(small_config(1));

        let conn = pool.get_connection().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Busy);
        drop(conn);

        let stats = wait_for_stats(&pool, |s| s.idle == 1).await;
        assert_eq!(stats.busy, 0);
        assert_eq!(factory.closed(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_closes_connection() {
        let (pool, factory) = memory_pool(small_config(1));

        let conn = pool.get_connection().await.unwrap();
        conn.invalidate().await;

        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.stats().total(), 0);
    }
}

// ============================================================================
// Abandonment
// ============================================================================

mod abandonment_tests {
    use super::*;

    #[tokio::test]
    async fn test_abandoned_connection_is_reclaimed() {
        let config = small_config(1)
            .with_max_wait(Some(Duration::from_millis(50)))
            .with_remove_abandoned_timeout(Some(Duration::from_secs(1)))
            .with_log_abandoned(true);
        let (pool, factory, clock) = mock_clock_pool(config);

        let leaked = pool.get_connection().await.unwrap();
        assert!(leaked.abandonment_trace().is_some());
        assert!(matches!(
            pool.get_connection().await,
            Err(PoolError::PoolExhausted { .. })
        ));

        clock.advance(Duration::from_millis(500));
        assert_eq!(pool.run_maintenance().await.unwrap().abandoned, 0);

        clock.advance(Duration::from_secs(1));
        let report = pool.run_maintenance().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(factory.closed(), 1);

        assert!(leaked.is_reclaimed());
        let err = leaked.passthrough(|c| c.query("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionClosed));

        let replacement = pool.get_connection().await.unwrap();
        assert_ne!(replacement.id(), leaked.id());
        assert_eq!(pool.stats().abandoned, 1);

        // Releasing the reclaimed handle must not disturb the new borrower
        drop(leaked);
        tokio::task::yield_now().await;
        let stats = pool.stats();
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.returned, 0);
    }

    #[tokio::test]
    async fn test_reaping_frees_capacity_while_connection_is_locked() {
        let config = small_config(1)
            .with_max_wait(Some(Duration::from_millis(200)))
            .with_remove_abandoned_timeout(Some(Duration::from_secs(1)));
        let (pool, factory, clock) = mock_clock_pool(config);

        let leaked = pool.get_connection().await.unwrap();
        let guard = leaked.lock().await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(pool.run_maintenance().await.unwrap().abandoned, 1);
        let stats = pool.stats();
        assert_eq!((stats.busy, stats.pending), (0, 0));

        let replacement = pool.get_connection().await.unwrap();
        assert_ne!(replacement.id(), leaked.id());
        assert_eq!(factory.closed(), 0);

        // Closed once the borrower lets go of it
        drop(guard);
        wait_for_stats(&pool, |s| s.destroyed == 1).await;
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.stats().busy, 1);
    }

    #[tokio::test]
    async fn test_reaping_disabled_without_timeout() {
        let (pool, _, clock) = mock_clock_pool(small_config(1));

        let _held = pool.get_connection().await.unwrap();
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(pool.run_maintenance().await.unwrap().abandoned, 0);
        assert_eq!(pool.stats().busy, 1);
    }
}

// ============================================================================
// Shutdown
// ============================================================================

mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_with_busy_connection() {
        let config = small_config(2).with_shutdown_grace(Duration::from_secs(5));
        let (pool, factory) = memory_pool(config);
        let pool = Arc::new(pool);

        let mut busy = pool.get_connection().await.unwrap();
        let mut spare = pool.get_connection().await.unwrap();
        spare.release().await;
        assert_eq!(pool.stats().idle, 1);

        let closing = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.close().await })
        };

        // Idle connection closes right away
        wait_for_stats(&pool, |s| s.idle == 0).await;
        assert!(pool.is_closed());
        assert_eq!(factory.closed(), 1);

        assert!(matches!(
            pool.get_connection().await,
            Err(PoolError::PoolClosed)
        ));

        // The busy one closes when it comes back
        busy.release().await;
        let report = closing.await.unwrap();
        assert_eq!(report.idle_closed, 1);
        assert!(report.drained);
        assert_eq!(report.outstanding, 0);
        assert_eq!(factory.closed(), 2);
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_grace_expires() {
        let config = small_config(1).with_shutdown_grace(Duration::from_millis(30));
        let (pool, factory) = memory_pool(config);

        let mut busy = pool.get_connection().await.unwrap();
        let report = pool.close().await;
        assert!(!report.drained);
        assert_eq!(report.outstanding, 1);

        busy.release().await;
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.stats().total(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let (pool, _) = memory_pool(small_config(1));
        let pool = Arc::new(pool);
        let held = pool.get_connection().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow_timeout(None).await.map(|c| c.id()) })
        };
        wait_for_waiters(&pool, 1).await;

        let closing = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.close().await })
        };
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::PoolClosed)));
        drop(held);
        assert!(closing.await.unwrap().drained);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (pool, _) = memory_pool(small_config(1));
        let mut conn = pool.get_connection().await.unwrap();
        conn.release().await;

        let first = pool.close().await;
        assert_eq!(first.idle_closed, 1);
        let second = pool.close().await;
        assert_eq!(second.idle_closed, 0);
        assert!(pool.is_closed());
    }
}

// ============================================================================
// Cancelled Release and Close
// ============================================================================

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_release_frees_capacity() {
        let config = small_config(1).with_test_on_return(true);
        let (pool, factory) = memory_pool(config);

        let mut conn = pool.get_connection().await.unwrap();
        let first_id = conn.id();
        factory.set_validation_delay(Duration::from_secs(1));

        let attempt = tokio::time::timeout(Duration::from_millis(20), conn.release()).await;
        assert!(attempt.is_err());
        drop(conn);

        // The connection caught mid-validation is closed in the background
        let stats = wait_for_stats(&pool, |s| s.destroyed == 1).await;
        assert_eq!(stats.total(), 0);
        assert_eq!(factory.closed(), 1);

        factory.set_validation_delay(Duration::ZERO);
        let replacement = tokio::time::timeout(Duration::from_millis(500), pool.get_connection())
            .await
            .expect("capacity was not returned")
            .unwrap();
        assert_ne!(replacement.id(), first_id);
        assert_eq!(factory.live(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_release_hands_slot_to_waiter() {
        let config = small_config(1).with_test_on_return(true);
        let (pool, factory) = memory_pool(config);
        let pool = Arc::new(pool);

        let mut conn = pool.get_connection().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_connection().await })
        };
        wait_for_waiters(&pool, 1).await;

        factory.set_validation_delay(Duration::from_secs(1));
        let attempt = tokio::time::timeout(Duration::from_millis(20), conn.release()).await;
        assert!(attempt.is_err());

        let served = waiter.await.unwrap().unwrap();
        assert_eq!(served.id(), 2);
        assert_within_capacity(&pool.stats());
    }

    #[tokio::test]
    async fn test_cancelled_close_still_drains() {
        let config = small_config(2).with_shutdown_grace(Duration::from_secs(5));
        let (pool, factory) = memory_pool(config);

        let mut busy = pool.get_connection().await.unwrap();
        let mut spare = pool.get_connection().await.unwrap();
        spare.release().await;

        let attempt = tokio::time::timeout(Duration::from_millis(20), pool.close()).await;
        assert!(attempt.is_err());
        assert!(pool.is_closed());
        assert_eq!(factory.closed(), 1);

        busy.release().await;
        assert_eq!(factory.closed(), 2);
        assert_eq!(factory.live(), 0);
        assert_eq!(pool.stats().total(), 0);
        assert_eq!(pool.close().await.outstanding, 0);
    }
}

// ============================================================================
// Waiter Fairness and Cancellation
// ============================================================================

mod waiter_tests {
    use super::*;

    #[tokio::test]
    async fn test_waiters_are_served_in_fifo_order() {
        let (pool, _) = memory_pool(small_config(1));
        let pool = Arc::new(pool);
        let mut held = pool.get_connection().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        for label in ["first", "second", "third"] {
            let task_pool = Arc::clone(&pool);
            let tx = tx.clone();
            let queued = pool.stats().waiting;
            tasks.push(tokio::spawn(async move {
                let mut conn = task_pool.get_connection().await.unwrap();
                tx.send(label).unwrap();
                conn.release().await;
            }));
            wait_for_waiters(&pool, queued + 1).await;
        }

        held.release().await;
        for task in tasks {
            task.await.unwrap();
        }

        let mut order = Vec::new();
        while let Ok(label) = rx.try_recv() {
            order.push(label);
        }
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_new_borrower_does_not_overtake_waiter() {
        let (pool, _) = memory_pool(small_config(1));
        let pool = Arc::new(pool);
        let mut held = pool.get_connection().await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_connection().await })
        };
        wait_for_waiters(&pool, 1).await;

        held.release().await;
        // The connection went straight to the waiter, not to the idle set
        assert_eq!(pool.stats().idle, 0);
        let served = waiter.await.unwrap().unwrap();
        assert_eq!(served.id(), held_id);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_dangling_grant() {
        let (pool, factory) = memory_pool(small_config(1));
        let pool = Arc::new(pool);
        let mut held = pool.get_connection().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow_timeout(None).await.map(|c| c.id()) })
        };
        wait_for_waiters(&pool, 1).await;

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        wait_for_waiters(&pool, 0).await;

        held.release().await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.pending, 0);

        let again = pool.get_connection().await.unwrap();
        assert_eq!(again.id(), 1);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_waiters_do_not_leak_capacity() {
        let config = small_config(1).with_max_wait(Some(Duration::from_millis(5)));
        let (pool, _) = memory_pool(config);
        let pool = Arc::new(pool);
        let mut held = pool.get_connection().await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.get_connection().await.map(|c| c.id()) })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(2)).await;
        held.release().await;

        for task in tasks {
            let _ = task.await.unwrap();
        }

        let stats = wait_for_stats(&pool, |s| s.busy == 0 && s.pending == 0).await;
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.idle, 1);
        assert!(pool.get_connection().await.is_ok());
    }
}

// ============================================================================
// Lazy Initialisation
// ============================================================================

mod lazy_init_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_builds_one_core() {
        let (pool, factory) = memory_pool(small_config(4));
        let pool = Arc::new(pool);
        assert!(!pool.is_initialized());

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let mut conn = pool.get_connection().await.unwrap();
                    conn.release().await;
                    Arc::as_ptr(pool.core().unwrap()) as usize
                })
            })
            .collect();

        let mut cores = Vec::new();
        for task in tasks {
            cores.push(task.await.unwrap());
        }
        cores.dedup();
        assert_eq!(cores.len(), 1);

        let stats = pool.stats();
        assert_eq!(stats.borrowed, 32);
        assert!(factory.opened() <= 4);
        assert!(matches!(pool.init().await, Err(PoolError::AlreadyInitialized)));
    }
}
