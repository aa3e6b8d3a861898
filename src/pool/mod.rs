//! Connection pool.
//!
//! [`ConnectionPool`] is the entry point embedding code holds on to. It builds
//! its [`PoolCore`] lazily on first use, exactly once even when many tasks race
//! to borrow first, and forwards borrows, shutdown and introspection to it.
//!
//! # Example
//!
//! ```
//! use connpool::testing::MemoryFactory;
//! use connpool::{ConnectionPool, PoolConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> connpool::Result<()> {
//! let config = PoolConfig::default()
//!     .with_max_active(4)
//!     .with_max_wait(Some(Duration::from_millis(250)))
//!     .with_test_on_borrow(true);
//! let pool = ConnectionPool::new(MemoryFactory::new(), config)?;
//!
//! let mut conn = pool.get_connection().await?;
//! conn.passthrough(|c| c.query("SELECT 1")).await?;
//! conn.release().await;
//!
//! let report = pool.close().await;
//! assert!(report.drained);
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(example()).unwrap();
//! ```

/// Borrowed connection handle.
pub mod connection;

/// Pool state machine.
pub mod core;

/// Eviction, validation, abandonment reaping and backfill.
pub mod maintenance;

/// Counters and snapshots.
pub mod stats;

pub use self::connection::{ConnectionState, PooledConnection};
pub use self::core::{PoolCore, ShutdownReport};
pub use self::maintenance::MaintenanceReport;
pub use self::stats::PoolStats;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::factory::{ConnectionFactory, Native};

/// Lazily initialised connection pool
pub struct ConnectionPool<F: ConnectionFactory> {
    config: PoolConfig,
    factory: Arc<F>,
    clock: Arc<dyn Clock>,
    core: OnceCell<Arc<PoolCore<F>>>,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool. Nothing is connected until first use.
    ///
    /// Fails with [`PoolError::Configuration`] when `config` is invalid.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        Self::with_clock(factory, config, Arc::new(SystemClock))
    }

    /// Create a pool that stamps connection ages with `clock`
    pub fn with_clock(factory: F, config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory: Arc::new(factory),
            clock,
            core: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the core has been built
    pub fn is_initialized(&self) -> bool {
        self.core.get().is_some()
    }

    /// The core, if it has been built
    pub fn core(&self) -> Option<&Arc<PoolCore<F>>> {
        self.core.get()
    }

    /// Build the core now instead of on first borrow and open `min_idle`
    /// connections up front.
    ///
    /// Fails with [`PoolError::AlreadyInitialized`] if the core exists.
    pub async fn init(&self) -> Result<()> {
        let mut built = false;
        let core = self.live_core_with(|| built = true).await?;
        if !built {
            return Err(PoolError::AlreadyInitialized);
        }
        let warmed = core.ensure_min_idle().await;
        debug!(warmed, "Pool initialized");
        Ok(())
    }

    /// Borrow a connection, waiting up to the configured `max_wait`
    pub async fn get_connection(&self) -> Result<PooledConnection<F>> {
        self.borrow_timeout(self.config.max_wait).await
    }

    /// Alias for [`get_connection`](Self::get_connection)
    pub async fn borrow(&self) -> Result<PooledConnection<F>> {
        self.get_connection().await
    }

    /// Borrow a connection, waiting up to `max_wait` (`None` waits forever)
    pub async fn borrow_timeout(&self, max_wait: Option<Duration>) -> Result<PooledConnection<F>> {
        let core = self.live_core().await?;
        core.borrow_timeout(max_wait).await
    }

    /// Shut the pool down. Later calls return an empty report.
    ///
    /// See [`PoolCore::shutdown`] for the drain semantics.
    pub async fn close(&self) -> ShutdownReport {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Pool already closed");
            return ShutdownReport::default();
        }
        match self.core.get() {
            Some(core) => core.shutdown().await,
            None => {
                debug!("Closing pool that was never used");
                ShutdownReport {
                    drained: true,
                    ..ShutdownReport::default()
                }
            }
        }
    }

    /// Run one maintenance pass now
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let core = self.live_core().await?;
        Ok(core.run_maintenance().await)
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        match self.core.get() {
            Some(core) => core.stats(),
            None => PoolStats {
                max_active: self.config.max_active,
                ..PoolStats::default()
            },
        }
    }

    /// The physical connection factory, once the pool is live
    pub fn native_factory(&self) -> Native<&F> {
        if self.core.get().is_some() {
            Native::Available(self.factory.as_ref())
        } else {
            Native::Unsupported("pool not initialized")
        }
    }

    /// Ask the driver whether it supports `capability`.
    ///
    /// Fails with [`PoolError::NotSupported`] before initialisation or when
    /// the driver cannot answer.
    pub fn supports(&self, capability: &str) -> Result<bool> {
        let factory = self.native_factory().into_result()?;
        factory.supports(capability).ok_or_else(|| {
            PoolError::NotSupported(format!(
                "{} cannot report capability '{capability}'",
                factory.describe()
            ))
        })
    }

    async fn live_core(&self) -> Result<&Arc<PoolCore<F>>> {
        self.live_core_with(|| {}).await
    }

    /// Get or build the core, refusing once the facade is closed. `on_build`
    /// runs only in the call that built it.
    async fn live_core_with(&self, on_build: impl FnOnce()) -> Result<&Arc<PoolCore<F>>> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        let core = self.core.get_or_init(|| {
            on_build();
            PoolCore::start(
                self.config.clone(),
                Arc::clone(&self.factory),
                Arc::clone(&self.clock),
            )
        });
        // close() may have run before the core existed and missed it
        if self.is_closed() {
            core.shutdown().await;
            return Err(PoolError::PoolClosed);
        }
        Ok(core)
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("factory", &self.factory.describe())
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}
