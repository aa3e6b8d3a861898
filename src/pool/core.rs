//! Pool core state machine
//!
//! All membership changes (idle set, busy set, wait queue, reserved slots)
//! happen inside [`PoolCore::with_state`], under one `parking_lot` mutex that
//! is never held across an `.await`. Opening, validating and closing physical
//! connections run outside the lock: a slot is reserved first (`pending`), the
//! slow I/O runs, and the outcome is committed under the lock again.
//!
//! Capacity is `idle + busy + pending <= max_active` at all times. `pending`
//! covers connections being created, validated or closed, and grants handed
//! to a waiter that has not claimed them yet. Outside the lock every pending
//! slot is owned by a [`Reservation`], so a future dropped at any `.await`
//! gives its slot back.
//!
//! Waiters are served strictly FIFO. A released connection goes straight to
//! the oldest waiter; a discarded one hands the oldest waiter a free slot.

use std::backtrace::Backtrace;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, trace, warn};

use super::connection::{IdleConnection, Lease, PooledConnection};
use super::maintenance::MaintenanceTask;
use super::stats::{PoolCounters, PoolStats};
use crate::clock::Clock;
use crate::config::{IdleOrder, PoolConfig};
use crate::error::{PoolError, Result};
use crate::factory::ConnectionFactory;

/// What a waiter receives when it is woken
pub(crate) enum Grant<C> {
    /// A ready connection
    Connection(IdleConnection<C>),
    /// A reserved capacity slot; the waiter opens the connection itself
    Slot,
}

struct WaiterEntry<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

pub(crate) struct PoolState<C> {
    pub(crate) idle: VecDeque<IdleConnection<C>>,
    pub(crate) busy: HashMap<u64, Arc<Lease<C>>>,
    pub(crate) pending: usize,
    waiters: VecDeque<WaiterEntry<C>>,
    pub(crate) closed: bool,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            busy: HashMap::new(),
            pending: 0,
            waiters: VecDeque::new(),
            closed: false,
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Hand `grant` to the oldest live waiter. The caller's reservation moves
    /// with it; on `Err` the caller still holds both.
    fn hand_to_waiter(&mut self, mut grant: Grant<C>) -> std::result::Result<(), Grant<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "Handed grant to waiter");
                    return Ok(());
                }
                Err(back) => grant = back,
            }
        }
        Err(grant)
    }
}

/// Result of one pass of the borrow decision
enum Step<C> {
    Closed,
    Idle(IdleConnection<C>),
    Create,
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

/// Summary returned by [`PoolCore::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Idle connections closed immediately
    pub idle_closed: usize,
    /// Whether every busy connection came back within the grace period
    pub drained: bool,
    /// Busy or in-flight connections still outstanding when shutdown returned
    pub outstanding: usize,
}

/// The pool state machine
pub struct PoolCore<F: ConnectionFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState<F::Connection>>,
    pub(crate) counters: PoolCounters,
    next_connection_id: AtomicU64,
    next_waiter_id: AtomicU64,
    drained: Notify,
    shutdown_started: AtomicBool,
    pub(crate) maintenance: Mutex<Option<MaintenanceTask>>,
}

impl<F: ConnectionFactory> PoolCore<F> {
    /// Build the core and start background maintenance if configured.
    ///
    /// The configuration must already be validated.
    pub fn start(config: PoolConfig, factory: Arc<F>, clock: Arc<dyn Clock>) -> Arc<Self> {
        info!(
            factory = %factory.describe(),
            max_active = config.max_active,
            max_idle = config.max_idle,
            min_idle = config.min_idle,
            max_wait = ?config.max_wait,
            "Starting connection pool"
        );
        let core = Arc::new(Self {
            config,
            factory,
            clock,
            state: Mutex::new(PoolState::new()),
            counters: PoolCounters::default(),
            next_connection_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
            drained: Notify::new(),
            shutdown_started: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        });
        core.start_maintenance();
        core
    }

    /// The pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The physical connection factory
    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether shutdown has begun
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Lock-free snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.max_active)
    }

    /// Run `f` under the pool lock, then republish gauges.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PoolState<F::Connection>) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        debug_assert!(state.total() <= self.config.max_active);
        self.counters.publish(
            state.idle.len(),
            state.busy.len(),
            state.pending,
            state.waiters.len(),
        );
        if state.closed && state.busy.is_empty() && state.pending == 0 {
            self.drained.notify_waiters();
        }
        result
    }

    // ========================================================================
    // Borrow
    // ========================================================================

    /// Borrow a connection, waiting at most `max_wait` from the configuration
    pub async fn borrow(self: &Arc<Self>) -> Result<PooledConnection<F>> {
        self.borrow_timeout(self.config.max_wait).await
    }

    /// Borrow a connection, waiting at most `max_wait` (`None` waits forever)
    pub async fn borrow_timeout(
        self: &Arc<Self>,
        max_wait: Option<Duration>,
    ) -> Result<PooledConnection<F>> {
        let started = tokio::time::Instant::now();
        let deadline = max_wait.map(|wait| started + wait);
        // Kept across failed validations so a retry never queues again
        let mut reservation: Option<Reservation<F>> = None;

        loop {
            let holding_slot = reservation.is_some();
            let step = self.with_state(|state| self.next_step(state, holding_slot));

            let grant = match step {
                Step::Closed => return Err(PoolError::PoolClosed),
                Step::Idle(idle) => Grant::Connection(idle),
                Step::Create => Grant::Slot,
                Step::Wait(id, rx) => {
                    let waiter = Waiter {
                        core: Arc::clone(self),
                        id,
                        rx,
                        settled: false,
                    };
                    self.wait(waiter, deadline, started).await?
                }
            };
            let slot = reservation.get_or_insert_with(|| Reservation::new(self));

            match grant {
                Grant::Connection(idle) => {
                    let id = idle.id;
                    slot.hold(idle);
                    if self.config.test_on_borrow && !self.validate_reserved(slot).await {
                        PoolCounters::bump(&self.counters.validation_failures);
                        warn!(connection_id = id, "Connection failed validation on borrow");
                        if let Some(bad) = slot.take() {
                            self.close_physical(bad.conn).await;
                        }
                        continue;
                    }
                    return self.commit(slot).await;
                }
                Grant::Slot => {
                    let (id, conn) = self.open().await?;
                    let now = self.clock.now();
                    slot.hold(IdleConnection {
                        id,
                        conn,
                        created_at: now,
                        last_used_at: now,
                    });
                    return self.commit(slot).await;
                }
            }
        }
    }

    /// Decide how to satisfy a borrow. Runs under the lock.
    fn next_step(
        &self,
        state: &mut PoolState<F::Connection>,
        holding_slot: bool,
    ) -> Step<F::Connection> {
        if state.closed {
            return Step::Closed;
        }

        if holding_slot {
            // The popped connection takes over our reservation, which frees
            // the capacity it was counted under
            return match self.pop_idle(state) {
                Some(idle) => {
                    self.dispatch_slot(state);
                    Step::Idle(idle)
                }
                None => Step::Create,
            };
        }

        // Strict FIFO: never overtake a queued borrower
        if !state.has_waiters() {
            if let Some(idle) = self.pop_idle(state) {
                state.pending += 1;
                return Step::Idle(idle);
            }
            if state.total() < self.config.max_active {
                state.pending += 1;
                return Step::Create;
            }
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(WaiterEntry { id, tx });
        trace!(waiter = id, queued = state.waiters.len(), "Borrower queued");
        Step::Wait(id, rx)
    }

    fn pop_idle(
        &self,
        state: &mut PoolState<F::Connection>,
    ) -> Option<IdleConnection<F::Connection>> {
        match self.config.idle_order {
            IdleOrder::Lifo => state.idle.pop_back(),
            IdleOrder::Fifo => state.idle.pop_front(),
        }
    }

    async fn wait(
        &self,
        mut waiter: Waiter<F>,
        deadline: Option<tokio::time::Instant>,
        started: tokio::time::Instant,
    ) -> Result<Grant<F::Connection>> {
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut waiter.rx).await,
            None => Ok((&mut waiter.rx).await),
        };

        match outcome {
            Ok(Ok(grant)) => {
                waiter.settled = true;
                Ok(grant)
            }
            // Senders are only dropped unsent at shutdown
            Ok(Err(_)) => {
                waiter.settled = true;
                Err(PoolError::PoolClosed)
            }
            Err(_) => {
                // Dropping the waiter withdraws it and recovers any racing grant
                drop(waiter);
                PoolCounters::bump(&self.counters.timeouts);
                let waited = started.elapsed();
                debug!(waited = ?waited, "Borrow timed out waiting for capacity");
                Err(PoolError::PoolExhausted { waited })
            }
        }
    }

    /// Move a reserved connection into the busy set
    async fn commit(
        self: &Arc<Self>,
        reservation: &mut Reservation<F>,
    ) -> Result<PooledConnection<F>> {
        let Some(IdleConnection {
            id,
            conn,
            created_at,
            ..
        }) = reservation.take()
        else {
            return Err(PoolError::ConnectionClosed);
        };
        let lease = Arc::new(Lease::new(id, conn, created_at, self.clock.now()));
        if self.config.log_abandoned {
            lease.mark_abandoned_candidate(Backtrace::force_capture());
        }

        let accepted = self.with_state(|state| {
            if state.closed {
                return false;
            }
            state.pending -= 1;
            state.busy.insert(id, Arc::clone(&lease));
            true
        });

        if !accepted {
            // Shutdown began while we were validating or connecting; the
            // reservation is freed when it drops
            debug!(connection_id = id, "Pool closed during checkout");
            if let Ok(Some(conn)) = lease.try_take() {
                self.close_physical(conn).await;
            }
            return Err(PoolError::PoolClosed);
        }
        reservation.disarm();

        PoolCounters::bump(&self.counters.borrowed);
        debug!(connection_id = id, "Connection borrowed");
        Ok(PooledConnection::new(Arc::clone(self), lease))
    }

    // ========================================================================
    // Return
    // ========================================================================

    /// Route a released lease back into the pool
    pub(crate) async fn release(self: &Arc<Self>, lease: &Lease<F::Connection>) {
        let was_busy = self.with_state(|state| {
            if state.busy.remove(&lease.id).is_some() {
                state.pending += 1;
                true
            } else {
                false
            }
        });
        if !was_busy {
            // The reaper already took it; close whatever it left behind
            debug!(connection_id = lease.id, "Released connection was already reclaimed");
            if let Some(conn) = lease.take().await {
                self.close_physical(conn).await;
            }
            return;
        }
        let mut slot = Reservation::new(self);

        PoolCounters::bump(&self.counters.returned);
        let Some(conn) = lease.take().await else {
            return;
        };
        slot.hold(IdleConnection {
            id: lease.id,
            conn,
            created_at: lease.created_at,
            last_used_at: self.clock.now(),
        });

        let keep = if self.is_closed() {
            debug!(connection_id = lease.id, "Pool closed, closing returned connection");
            false
        } else if lease.is_poisoned() {
            debug!(connection_id = lease.id, "Discarding broken connection");
            false
        } else if self.config.test_on_return && !self.validate_reserved(&mut slot).await {
            PoolCounters::bump(&self.counters.validation_failures);
            warn!(connection_id = lease.id, "Connection failed validation on return");
            false
        } else {
            true
        };

        if !keep {
            self.destroy(slot).await;
        } else if self.restore(slot).await {
            debug!(connection_id = lease.id, "Connection returned to pool");
        }
    }

    /// Release path for handles dropped without `release()`
    pub(crate) fn release_detached(core: &Arc<Self>, lease: Arc<Lease<F::Connection>>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let core = Arc::clone(core);
                handle.spawn(async move {
                    core.release(&lease).await;
                });
            }
            Err(_) => {
                // No runtime to close on: drop the connection and free its slot
                let was_busy = core.with_state(|state| state.busy.remove(&lease.id).is_some());
                if was_busy {
                    warn!(
                        connection_id = lease.id,
                        "Connection dropped outside a runtime, closing without factory"
                    );
                    drop(lease.try_take());
                    PoolCounters::bump(&core.counters.destroyed);
                    core.with_state(|state| core.dispatch_slot(state));
                }
            }
        }
    }

    /// Put a reserved connection back: to the oldest waiter, else the idle set.
    /// Returns the connection when it must be destroyed instead; the caller
    /// then still holds the reservation. Runs under the lock.
    pub(crate) fn give_back(
        &self,
        state: &mut PoolState<F::Connection>,
        idle: IdleConnection<F::Connection>,
    ) -> Option<IdleConnection<F::Connection>> {
        if state.closed {
            return Some(idle);
        }
        match state.hand_to_waiter(Grant::Connection(idle)) {
            Ok(()) => None,
            Err(Grant::Connection(idle)) => {
                if state.idle.len() >= self.config.max_idle {
                    trace!(connection_id = idle.id, "Idle set full");
                    return Some(idle);
                }
                state.pending -= 1;
                state.idle.push_back(idle);
                None
            }
            Err(Grant::Slot) => None,
        }
    }

    /// Release a reservation and offer the freed capacity to a waiter
    fn free_slot(&self, state: &mut PoolState<F::Connection>) {
        state.pending -= 1;
        self.dispatch_slot(state);
    }

    /// Give spare capacity to the oldest waiter, if any
    pub(crate) fn dispatch_slot(&self, state: &mut PoolState<F::Connection>) {
        if state.closed || !state.has_waiters() || state.total() >= self.config.max_active {
            return;
        }
        state.pending += 1;
        if state.hand_to_waiter(Grant::Slot).is_err() {
            state.pending -= 1;
        }
    }

    /// Hand a reserved connection back via [`give_back`](Self::give_back),
    /// closing it when there is no room. Returns whether it was kept.
    pub(crate) async fn restore(&self, mut slot: Reservation<F>) -> bool {
        let Some(idle) = slot.take() else {
            return false;
        };
        match self.with_state(|state| self.give_back(state, idle)) {
            None => {
                slot.disarm();
                true
            }
            Some(rejected) => {
                self.close_physical(rejected.conn).await;
                false
            }
        }
    }

    /// Return an unclaimed grant from a waiter that gave up
    fn reassign(
        self: &Arc<Self>,
        state: &mut PoolState<F::Connection>,
        grant: Grant<F::Connection>,
    ) {
        match grant {
            Grant::Connection(idle) => {
                trace!(connection_id = idle.id, "Recovering grant from withdrawn waiter");
                if let Some(rejected) = self.give_back(state, idle) {
                    self.discard_detached(rejected.conn);
                    self.free_slot(state);
                }
            }
            Grant::Slot => self.free_slot(state),
        }
    }

    // ========================================================================
    // Physical connection I/O (never under the lock)
    // ========================================================================

    /// Open a physical connection through the factory
    pub(crate) async fn open(&self) -> Result<(u64, F::Connection)> {
        match self.factory.open().await {
            Ok(conn) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                PoolCounters::bump(&self.counters.created);
                debug!(connection_id = id, "Opened new physical connection");
                Ok((id, conn))
            }
            Err(e) => {
                PoolCounters::bump(&self.counters.create_failures);
                warn!(error = %e, "Failed to open connection");
                Err(match e {
                    e @ PoolError::ConnectionCreate { .. } => e,
                    other => PoolError::create(other),
                })
            }
        }
    }

    /// Validate the connection a reservation holds
    pub(crate) async fn validate_reserved(&self, slot: &mut Reservation<F>) -> bool {
        match slot.held_mut() {
            Some(idle) => self.validate(&mut idle.conn).await,
            None => false,
        }
    }

    /// Validate with the configured timeout; a timeout counts as failure
    pub(crate) async fn validate(&self, conn: &mut F::Connection) -> bool {
        match self.config.validation_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.factory.validate(conn)).await {
                Ok(valid) => valid,
                Err(_) => {
                    warn!(timeout = ?limit, "Connection validation timed out");
                    false
                }
            },
            None => self.factory.validate(conn).await,
        }
    }

    /// Physically close the connection a reservation holds, then free the slot
    pub(crate) async fn destroy(&self, mut slot: Reservation<F>) {
        if let Some(idle) = slot.take() {
            self.close_physical(idle.conn).await;
        }
    }

    pub(crate) async fn close_physical(&self, conn: F::Connection) {
        if let Err(e) = self.factory.close(conn).await {
            warn!(error = %e, "Error closing connection");
        }
        PoolCounters::bump(&self.counters.destroyed);
    }

    /// Close a connection that holds no reservation from outside async context
    pub(crate) fn discard_detached(self: &Arc<Self>, conn: F::Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let core = Arc::clone(self);
                handle.spawn(async move { core.close_physical(conn).await });
            }
            Err(_) => {
                drop(conn);
                PoolCounters::bump(&self.counters.destroyed);
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close the pool.
    ///
    /// Idle connections are closed immediately, waiting borrowers fail with
    /// [`PoolError::PoolClosed`], maintenance stops, and busy connections are
    /// given `shutdown_grace` to come back; any that return later are closed.
    /// The whole call is bounded by `shutdown_grace`. Later calls return an
    /// empty report.
    pub async fn shutdown(self: &Arc<Self>) -> ShutdownReport {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        info!("Shutting down connection pool");
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;

        let (idle, waiters) = self.with_state(|state| {
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.pending += idle.len();
            (idle, std::mem::take(&mut state.waiters))
        });
        let slots: Vec<_> = idle
            .into_iter()
            .map(|idle| Reservation::holding(self, idle))
            .collect();
        // Dropped senders wake every waiter with PoolClosed
        drop(waiters);

        let idle_closed = slots.len();
        let closing = async {
            for slot in slots {
                self.destroy(slot).await;
            }
            self.stop_maintenance().await;
        };
        if tokio::time::timeout_at(deadline, closing).await.is_err() {
            warn!("Shutdown grace elapsed while closing idle connections");
        }

        let drained = loop {
            let notified = self.drained.notified();
            if self.with_state(|state| state.busy.is_empty() && state.pending == 0) {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break false;
            }
        };

        let outstanding = self.with_state(|state| state.busy.len() + state.pending);
        if drained {
            info!(idle_closed, "Connection pool shut down");
        } else {
            warn!(
                idle_closed,
                outstanding, "Connection pool shut down with connections still in use"
            );
        }
        ShutdownReport {
            idle_closed,
            drained,
            outstanding,
        }
    }
}

impl<F: ConnectionFactory> Drop for PoolCore<F> {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.get_mut().take() {
            task.cancel();
        }
    }
}

/// One capacity slot counted in `pending`, plus the connection occupying it
/// while that connection is in neither set. Dropping it while armed (an
/// error return or a cancelled future) frees the slot and closes any
/// connection it still holds in the background.
pub(crate) struct Reservation<F: ConnectionFactory> {
    core: Arc<PoolCore<F>>,
    held: Option<IdleConnection<F::Connection>>,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<F> {
    /// Take over a slot the caller just counted in `pending`
    pub(crate) fn new(core: &Arc<PoolCore<F>>) -> Self {
        Self {
            core: Arc::clone(core),
            held: None,
            armed: true,
        }
    }

    /// Take over a slot together with the connection occupying it
    pub(crate) fn holding(core: &Arc<PoolCore<F>>, idle: IdleConnection<F::Connection>) -> Self {
        let mut slot = Self::new(core);
        slot.hold(idle);
        slot
    }

    pub(crate) fn hold(&mut self, idle: IdleConnection<F::Connection>) {
        self.held = Some(idle);
    }

    pub(crate) fn held_mut(&mut self) -> Option<&mut IdleConnection<F::Connection>> {
        self.held.as_mut()
    }

    pub(crate) fn take(&mut self) -> Option<IdleConnection<F::Connection>> {
        self.held.take()
    }

    /// The slot now belongs to the idle set, the busy set or a waiter
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let core = &self.core;
        if let Some(idle) = self.held.take() {
            trace!(connection_id = idle.id, "Closing connection of a dropped reservation");
            core.discard_detached(idle.conn);
        }
        core.with_state(|state| core.free_slot(state));
    }
}

/// A queued borrower. Dropping it before it was settled (timeout or a
/// cancelled borrow future) withdraws it from the queue and recovers any
/// grant that was sent in the meantime.
struct Waiter<F: ConnectionFactory> {
    core: Arc<PoolCore<F>>,
    id: u64,
    rx: oneshot::Receiver<Grant<F::Connection>>,
    settled: bool,
}

impl<F: ConnectionFactory> Drop for Waiter<F> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let core = Arc::clone(&self.core);
        let id = self.id;
        let rx = &mut self.rx;
        core.with_state(|state| {
            if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                state.waiters.remove(pos);
                return;
            }
            // Already dequeued: a grant was sent under this same lock
            rx.close();
            if let Ok(grant) = rx.try_recv() {
                core.reassign(state, grant);
            }
        });
    }
}
