//! Pooled connection wrapper
//!
//! A borrowed connection lives in a [`Lease`] shared between the caller's
//! [`PooledConnection`] handle and the pool's busy set. The handle owns the
//! right to use the connection; the busy-set entry lets the abandonment reaper
//! reclaim it. Releasing the handle routes the connection back into the pool
//! exactly once.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::core::PoolCore;
use crate::error::{BoxError, PoolError, Result};
use crate::factory::{ConnectionFactory, Native};

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// In the idle set
    Idle,
    /// Checked out to a caller
    Busy,
    /// Out of both sets while a validation runs
    Validating,
    /// Physically closed and unreachable from the pool
    Discarded,
}

/// An idle connection together with its pool metadata
pub(crate) struct IdleConnection<C> {
    pub(crate) id: u64,
    pub(crate) conn: C,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
}

/// Shared state of a checked-out connection
pub(crate) struct Lease<C> {
    pub(crate) id: u64,
    pub(crate) created_at: Instant,
    pub(crate) borrowed_at: Instant,
    slot: Mutex<Option<C>>,
    /// Set when the driver reported a fatal error during use
    poisoned: AtomicBool,
    /// Set when the reaper took the connection away
    reclaimed: AtomicBool,
    trace: parking_lot::Mutex<Option<Backtrace>>,
}

impl<C> Lease<C> {
    pub(crate) fn new(id: u64, conn: C, created_at: Instant, borrowed_at: Instant) -> Self {
        Self {
            id,
            created_at,
            borrowed_at,
            slot: Mutex::new(Some(conn)),
            poisoned: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
            trace: parking_lot::Mutex::new(None),
        }
    }

    /// Record where the connection was borrowed, for abandonment diagnostics
    pub(crate) fn mark_abandoned_candidate(&self, trace: Backtrace) {
        *self.trace.lock() = Some(trace);
    }

    pub(crate) fn trace(&self) -> Option<String> {
        self.trace.lock().as_ref().map(ToString::to_string)
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_reclaimed(&self) {
        self.reclaimed.store(true, Ordering::SeqCst);
    }

    /// Take the connection out, waiting for any in-flight user operation
    pub(crate) async fn take(&self) -> Option<C> {
        self.slot.lock().await.take()
    }

    /// Take the connection out if nobody is using it right now
    pub(crate) fn try_take(&self) -> std::result::Result<Option<C>, ()> {
        match self.slot.try_lock() {
            Ok(mut guard) => Ok(guard.take()),
            Err(_) => Err(()),
        }
    }
}

/// A connection borrowed from the pool
///
/// Use the connection through [`passthrough`](Self::passthrough) or
/// [`lock`](Self::lock), then hand it back with [`release`](Self::release).
/// Dropping an unreleased handle schedules the release on the current tokio
/// runtime.
///
/// # Examples
///
/// ```
/// use connpool::testing::MemoryFactory;
/// use connpool::{ConnectionPool, PoolConfig};
///
/// # async fn example() -> connpool::Result<()> {
/// let pool = ConnectionPool::new(MemoryFactory::new(), PoolConfig::default())?;
///
/// let mut conn = pool.get_connection().await?;
/// let answer = conn
///     .passthrough(|c| c.query("SELECT 1"))
///     .await?;
/// assert_eq!(answer, "SELECT 1");
///
/// conn.release().await;
/// # Ok(())
/// # }
/// # tokio::runtime::Runtime::new().unwrap().block_on(example()).unwrap();
/// ```
pub struct PooledConnection<F: ConnectionFactory> {
    core: Arc<PoolCore<F>>,
    lease: Arc<Lease<F::Connection>>,
    released: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(core: Arc<PoolCore<F>>, lease: Arc<Lease<F::Connection>>) -> Self {
        Self {
            core,
            lease,
            released: false,
        }
    }

    /// Pool-unique identifier of the physical connection
    pub fn id(&self) -> u64 {
        self.lease.id
    }

    /// When the physical connection was opened
    pub fn created_at(&self) -> Instant {
        self.lease.created_at
    }

    /// When this borrow started
    pub fn borrowed_at(&self) -> Instant {
        self.lease.borrowed_at
    }

    /// Current lifecycle state as seen by this handle
    pub fn state(&self) -> ConnectionState {
        if self.released || self.lease.is_reclaimed() {
            ConnectionState::Discarded
        } else {
            ConnectionState::Busy
        }
    }

    /// Whether the handle can no longer reach its connection
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Discarded
    }

    /// Whether the pool reclaimed this connection as abandoned
    pub fn is_reclaimed(&self) -> bool {
        self.lease.is_reclaimed()
    }

    /// Whether the connection will be discarded instead of reused
    pub fn is_broken(&self) -> bool {
        self.lease.is_poisoned()
    }

    /// Mark the connection unusable; it is closed when released
    pub fn mark_broken(&self) {
        debug!(connection_id = self.lease.id, "Connection marked broken");
        self.lease.poison();
    }

    /// Backtrace captured at borrow time when `log_abandoned` is enabled
    pub fn abandonment_trace(&self) -> Option<String> {
        self.lease.trace()
    }

    /// Exclusive access to the raw connection
    ///
    /// Fails with [`PoolError::ConnectionClosed`] once the handle was released
    /// or the connection was reclaimed.
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, F::Connection>> {
        if self.is_closed() {
            return Err(PoolError::ConnectionClosed);
        }
        let guard = self.lease.slot.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| PoolError::ConnectionClosed)
    }

    /// The raw driver connection, or the reason it is unreachable
    pub async fn native(&self) -> Native<MappedMutexGuard<'_, F::Connection>> {
        match self.lock().await {
            Ok(guard) => Native::Available(guard),
            Err(_) => Native::Unsupported("connection is closed"),
        }
    }

    /// Run a driver operation against the raw connection
    ///
    /// An error the factory classifies as fatal poisons the connection so
    /// that it is discarded at release.
    pub async fn passthrough<R, E, Op>(&self, op: Op) -> Result<R>
    where
        Op: FnOnce(&mut F::Connection) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        let mut conn = self.lock().await?;
        match op(&mut *conn) {
            Ok(value) => Ok(value),
            Err(error) => {
                let source: BoxError = error.into();
                if self.core.factory().is_fatal(source.as_ref()) {
                    warn!(
                        connection_id = self.lease.id,
                        error = %source,
                        "Fatal driver error, connection will be discarded"
                    );
                    self.lease.poison();
                }
                Err(PoolError::Driver { source })
            }
        }
    }

    /// Return the connection to the pool
    ///
    /// Calling this more than once is harmless: later calls only log a warning.
    pub async fn release(&mut self) {
        if self.released {
            warn!(connection_id = self.lease.id, "Connection released twice");
            return;
        }
        self.released = true;
        self.core.release(&self.lease).await;
    }

    /// Release and force the connection to be closed instead of reused
    pub async fn invalidate(mut self) {
        self.lease.poison();
        self.release().await;
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!(connection_id = self.lease.id, "Connection dropped without release");
        PoolCore::release_detached(&self.core, Arc::clone(&self.lease));
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.lease.id)
            .field("state", &self.state())
            .field("broken", &self.is_broken())
            .finish()
    }
}
