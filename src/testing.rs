//! In-memory connection factory
//!
//! [`MemoryFactory`] opens [`MemoryConnection`]s without any I/O and exposes
//! knobs for the failure modes a pool has to survive: failing opens, failing
//! or slow validation, and connections that break mid-use. Clones share state,
//! so a test can keep a handle after moving the factory into a pool.

use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;

use crate::error::{PoolError, Result};
use crate::factory::ConnectionFactory;

/// A fake physical connection
#[derive(Debug)]
pub struct MemoryConnection {
    serial: usize,
    severed: bool,
    executed: Vec<String>,
}

impl MemoryConnection {
    /// Order in which the factory opened this connection, starting at 1
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Echo `sql` back.
    ///
    /// Statements starting with `BAD` fail with a non-fatal
    /// [`io::ErrorKind::InvalidInput`]; a severed connection fails with a
    /// fatal [`io::ErrorKind::BrokenPipe`].
    pub fn query(&mut self, sql: &str) -> std::result::Result<String, io::Error> {
        if self.severed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection severed"));
        }
        if sql.starts_with("BAD") {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "syntax error"));
        }
        self.executed.push(sql.to_string());
        Ok(sql.to_string())
    }

    /// Simulate the server dropping the connection
    pub fn sever(&mut self) {
        self.severed = true;
    }

    /// Whether the connection was severed
    pub fn is_severed(&self) -> bool {
        self.severed
    }

    /// Statements executed successfully on this connection
    pub fn executed(&self) -> &[String] {
        &self.executed
    }
}

#[derive(Debug, Default)]
struct Inner {
    opened: AtomicUsize,
    closed: AtomicUsize,
    validations: AtomicUsize,
    fail_open: AtomicBool,
    fail_validation: AtomicBool,
    validation_failure_rate: RwLock<f64>,
    open_delay: RwLock<Duration>,
    validation_delay: RwLock<Duration>,
    capabilities: RwLock<HashMap<String, bool>>,
}

/// Factory for [`MemoryConnection`]s
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    inner: Arc<Inner>,
}

impl MemoryFactory {
    /// Create a factory whose opens and validations always succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent validation fail
    pub fn set_fail_validation(&self, fail: bool) {
        self.inner.fail_validation.store(fail, Ordering::SeqCst);
    }

    /// Fail validations at random with probability `rate` (0.0 to 1.0)
    pub fn set_validation_failure_rate(&self, rate: f64) {
        *self.inner.validation_failure_rate.write() = rate.clamp(0.0, 1.0);
    }

    /// Delay each `open` by `delay`
    pub fn set_open_delay(&self, delay: Duration) {
        *self.inner.open_delay.write() = delay;
    }

    /// Delay each validation by `delay`
    pub fn set_validation_delay(&self, delay: Duration) {
        *self.inner.validation_delay.write() = delay;
    }

    /// Declare whether the fake driver supports `capability`
    pub fn set_capability(&self, capability: impl Into<String>, supported: bool) {
        self.inner
            .capabilities
            .write()
            .insert(capability.into(), supported);
    }

    /// Connections opened so far
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far
    pub fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opened minus closed
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    /// Validations performed so far
    pub fn validations(&self) -> usize {
        self.inner.validations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    type Connection = MemoryConnection;

    async fn open(&self) -> Result<MemoryConnection> {
        let delay = *self.inner.open_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(PoolError::create(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let serial = self.inner.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryConnection {
            serial,
            severed: false,
            executed: Vec::new(),
        })
    }

    async fn close(&self, _conn: MemoryConnection) -> Result<()> {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, conn: &mut MemoryConnection) -> bool {
        self.inner.validations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.validation_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if conn.severed || self.inner.fail_validation.load(Ordering::SeqCst) {
            return false;
        }
        let rate = *self.inner.validation_failure_rate.read();
        rate <= 0.0 || !rand::thread_rng().gen_bool(rate)
    }

    fn is_fatal(&self, error: &(dyn Error + Send + Sync + 'static)) -> bool {
        matches!(
            error.downcast_ref::<io::Error>().map(io::Error::kind),
            Some(
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }

    fn supports(&self, capability: &str) -> Option<bool> {
        self.inner.capabilities.read().get(capability).copied()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
