//! Background maintenance
//!
//! Idle eviction, idle validation, abandonment reaping and min-idle backfill.
//! Each sweep goes through the same `with_state` transitions as borrow and
//! release, taking the lock once per connection rather than for the whole
//! sweep. Slow work (validate, close, open) happens with the lock released,
//! on a slot owned by a [`Reservation`], so a pass can be dropped at any
//! `.await` without losing capacity.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::IdleConnection;
use super::core::{PoolCore, Reservation};
use super::stats::PoolCounters;
use crate::factory::ConnectionFactory;

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Idle connections closed for exceeding `min_evictable_idle_time`
    pub evicted: usize,
    /// Idle connections closed after failing validation
    pub invalid: usize,
    /// Busy connections reclaimed as abandoned
    pub abandoned: usize,
    /// Idle connections opened to restore `min_idle`
    pub created: usize,
}

impl MaintenanceReport {
    /// Whether the pass changed anything
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Handle to the spawned maintenance loop
pub(crate) struct MaintenanceTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl<F: ConnectionFactory> PoolCore<F> {
    /// Run every sweep once
    pub async fn run_maintenance(self: &Arc<Self>) -> MaintenanceReport {
        let report = MaintenanceReport {
            evicted: self.evict_idle().await,
            invalid: self.validate_idle().await,
            abandoned: self.reap_abandoned().await,
            created: self.ensure_min_idle().await,
        };
        if !report.is_empty() {
            debug!(?report, "Maintenance pass finished");
        }
        report
    }

    /// Close idle connections idle longer than `min_evictable_idle_time`,
    /// oldest first, never going below `min_idle`. Returns how many closed.
    pub async fn evict_idle(self: &Arc<Self>) -> usize {
        let max_idle_time = self.config().min_evictable_idle_time;
        let min_idle = self.config().min_idle;
        let mut evicted = 0;

        loop {
            let victim = self.with_state(|state| {
                if state.closed || state.idle.len() <= min_idle {
                    return None;
                }
                let (index, oldest) = state
                    .idle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, idle)| idle.last_used_at)?;
                if self.clock().elapsed_since(oldest.last_used_at) <= max_idle_time {
                    return None;
                }
                let victim = state.idle.remove(index)?;
                state.pending += 1;
                Some(victim)
            });
            let Some(victim) = victim else { break };
            debug!(connection_id = victim.id, "Evicting idle connection");
            let slot = Reservation::holding(self, victim);

            PoolCounters::bump(&self.counters.evicted);
            evicted += 1;
            self.destroy(slot).await;
        }
        evicted
    }

    /// Validate each idle connection once when `test_while_idle` is set.
    /// Returns how many failed and were closed.
    pub async fn validate_idle(self: &Arc<Self>) -> usize {
        if !self.config().test_while_idle {
            return 0;
        }
        let rounds = self.with_state(|state| state.idle.len());
        let mut invalid = 0;

        for _ in 0..rounds {
            let candidate = self.with_state(|state| {
                if state.closed {
                    return None;
                }
                let idle = state.idle.pop_front()?;
                state.pending += 1;
                Some(idle)
            });
            let Some(idle) = candidate else { break };
            let id = idle.id;
            let mut slot = Reservation::holding(self, idle);

            if self.validate_reserved(&mut slot).await {
                self.restore(slot).await;
            } else {
                warn!(connection_id = id, "Idle connection failed validation");
                PoolCounters::bump(&self.counters.validation_failures);
                invalid += 1;
                self.destroy(slot).await;
            }
        }
        invalid
    }

    /// Reclaim busy connections held longer than `remove_abandoned_timeout`.
    ///
    /// The borrower's handle turns into a closed handle; its later release
    /// is a no-op. Capacity is handed on as soon as a connection leaves the
    /// busy set, even if the borrower is still inside an operation on it.
    /// Returns how many were reclaimed.
    pub async fn reap_abandoned(self: &Arc<Self>) -> usize {
        let Some(timeout) = self.config().remove_abandoned_timeout else {
            return 0;
        };

        let expired: Vec<_> = self.with_state(|state| {
            let ids: Vec<u64> = state
                .busy
                .values()
                .filter(|lease| self.clock().elapsed_since(lease.borrowed_at) > timeout)
                .map(|lease| lease.id)
                .collect();
            let mut reclaimed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(lease) = state.busy.remove(&id) {
                    reclaimed.push(lease);
                }
            }
            for _ in &reclaimed {
                self.dispatch_slot(state);
            }
            reclaimed
        });

        for lease in &expired {
            lease.mark_reclaimed();
            PoolCounters::bump(&self.counters.abandoned);
            let held_for = self.clock().elapsed_since(lease.borrowed_at);
            match lease.trace() {
                Some(trace) => warn!(
                    connection_id = lease.id,
                    held_for = ?held_for,
                    borrowed_at = %trace,
                    "Reclaiming abandoned connection"
                ),
                None => warn!(
                    connection_id = lease.id,
                    held_for = ?held_for,
                    "Reclaiming abandoned connection"
                ),
            }
        }

        for lease in &expired {
            match lease.try_take() {
                Ok(Some(conn)) => self.close_physical(conn).await,
                Ok(None) => {}
                Err(()) => {
                    // The borrower is mid-operation; close once it lets go
                    let core = Arc::clone(self);
                    let lease = Arc::clone(lease);
                    tokio::spawn(async move {
                        if let Some(conn) = lease.take().await {
                            core.close_physical(conn).await;
                        }
                    });
                }
            }
        }
        expired.len()
    }

    /// Open idle connections until `min_idle` is reached, capacity runs out
    /// or someone is waiting. Create failures are logged and stop the pass.
    pub async fn ensure_min_idle(self: &Arc<Self>) -> usize {
        let min_idle = self.config().min_idle;
        let max_active = self.config().max_active;
        let mut created = 0;

        while min_idle > 0 {
            let reserved = self.with_state(|state| {
                if state.closed
                    || state.has_waiters()
                    || state.idle.len() >= min_idle
                    || state.total() >= max_active
                {
                    return false;
                }
                state.pending += 1;
                true
            });
            if !reserved {
                break;
            }
            let mut slot = Reservation::new(self);

            match self.open().await {
                Ok((id, conn)) => {
                    let now = self.clock().now();
                    slot.hold(IdleConnection {
                        id,
                        conn,
                        created_at: now,
                        last_used_at: now,
                    });
                    if !self.restore(slot).await {
                        break;
                    }
                    created += 1;
                }
                Err(e) => {
                    debug!(error = %e, "Could not backfill idle connections");
                    break;
                }
            }
        }
        created
    }

    /// Spawn the periodic maintenance loop when a period is configured and a
    /// runtime is available
    pub(crate) fn start_maintenance(self: &Arc<Self>) {
        let Some(period) = self.config().maintenance_period() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No tokio runtime available, background maintenance disabled");
                return;
            }
        };

        let token = CancellationToken::new();
        let handle = runtime.spawn(maintenance_loop(
            Arc::downgrade(self),
            period,
            token.clone(),
        ));
        info!(period = ?period, "Started pool maintenance");
        *self.maintenance.lock() = Some(MaintenanceTask { token, handle });
    }

    /// Cancel the maintenance loop and wait for it to exit
    pub(crate) async fn stop_maintenance(&self) {
        let Some(task) = self.maintenance.lock().take() else {
            return;
        };
        task.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
        debug!("Stopped pool maintenance");
    }
}

async fn maintenance_loop<F: ConnectionFactory>(
    core: Weak<PoolCore<F>>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(core) = core.upgrade() else { break };
        // Cancellation interrupts a pass; its reservations free themselves
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = core.run_maintenance() => {}
        }
    }
}
