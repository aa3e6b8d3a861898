//! # connpool - An Async Connection Pool
//!
//! connpool manages a bounded set of expensive, stateful connections (database
//! sessions, broker channels, anything with a costly handshake) on behalf of
//! concurrent tokio tasks. It hands out validated connections, takes them back,
//! and keeps the set healthy in the background.
//!
//! ## Core Concepts
//!
//! - **Factory**: a [`ConnectionFactory`] opens, closes and validates raw connections
//! - **Borrow**: request a connection; waits FIFO for capacity up to `max_wait`
//! - **Release**: hand the connection back; it is validated, reused or closed
//! - **Eviction**: idle connections past `min_evictable_idle_time` are closed
//! - **Abandonment**: connections held past `remove_abandoned_timeout` are reclaimed
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          ConnectionPool                              │
//! │          (lazy one-time core construction, close, introspection)     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            PoolCore                                  │
//! │        idle set · busy set · FIFO wait queue · capacity counter      │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │ PooledConnection│   │    Maintenance      │   │  ConnectionFactory  │
//! │ (borrowed       │   │  (evict, validate,  │   │  (open / close /    │
//! │  handle)        │   │   reap, backfill)   │   │   validate)         │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```
//! use connpool::prelude::*;
//! use connpool::testing::MemoryFactory;
//!
//! # async fn example() -> connpool::Result<()> {
//! let pool = ConnectionPool::new(MemoryFactory::new(), PoolConfig::production())?;
//!
//! let mut conn = pool.get_connection().await?;
//! let rows = conn.passthrough(|c| c.query("SELECT now()")).await?;
//! println!("{rows}");
//! conn.release().await;
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(example()).unwrap();
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.
    //!
    //! ```rust,ignore
    //! use connpool::prelude::*;
    //! ```

    pub use crate::clock::{Clock, MockClock, SystemClock};
    pub use crate::config::{IdleOrder, PoolConfig};
    pub use crate::error::{PoolError, Result};
    pub use crate::factory::{ConnectionFactory, Native};
    pub use crate::pool::{
        ConnectionPool, ConnectionState, MaintenanceReport, PoolStats, PooledConnection,
        ShutdownReport,
    };
}

/// Monotonic time sources.
pub mod clock;

/// Pool configuration, presets and file/environment loading.
pub mod config;

/// Error types.
pub mod error;

/// Physical connection factory trait.
pub mod factory;

/// Tracing subscriber setup for the binary.
pub mod logging;

/// The pool: facade, core state machine, handles and maintenance.
pub mod pool;

/// In-memory factory for tests, benchmarks and simulations.
pub mod testing;

pub use config::{IdleOrder, PoolConfig};
pub use error::{PoolError, Result};
pub use factory::{ConnectionFactory, Native};
pub use pool::{ConnectionPool, ConnectionState, PoolStats, PooledConnection, ShutdownReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
