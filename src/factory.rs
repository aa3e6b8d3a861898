//! Physical connection factory
//!
//! The pool never talks to a database itself. A [`ConnectionFactory`] opens,
//! closes and validates raw connections; the pool decides when.

use async_trait::async_trait;
use std::error::Error;

use crate::error::Result;

/// Creates, destroys and tests raw physical connections.
///
/// # Example
///
/// ```rust,ignore
/// struct PgFactory { url: String }
///
/// #[async_trait]
/// impl ConnectionFactory for PgFactory {
///     type Connection = PgConnection;
///
///     async fn open(&self) -> Result<PgConnection> {
///         PgConnection::connect(&self.url).await.map_err(PoolError::create)
///     }
///
///     async fn close(&self, conn: PgConnection) -> Result<()> {
///         conn.close().await.map_err(|e| PoolError::Driver { source: e.into() })
///     }
///
///     async fn validate(&self, conn: &mut PgConnection) -> bool {
///         conn.execute("SELECT 1").await.is_ok()
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The raw connection type handed to callers
    type Connection: Send + 'static;

    /// Open a new physical connection
    ///
    /// Failures should be reported as [`PoolError::ConnectionCreate`](crate::PoolError::ConnectionCreate).
    async fn open(&self) -> Result<Self::Connection>;

    /// Physically close a connection
    async fn close(&self, conn: Self::Connection) -> Result<()>;

    /// Cheap liveness check, e.g. a trivial query
    async fn validate(&self, conn: &mut Self::Connection) -> bool;

    /// Whether an error returned by a passthrough operation leaves the
    /// connection unusable. I/O errors are fatal by default.
    fn is_fatal(&self, error: &(dyn Error + Send + Sync + 'static)) -> bool {
        error.downcast_ref::<std::io::Error>().is_some()
    }

    /// Feature introspection on the real driver.
    ///
    /// `None` means the driver cannot answer the question.
    fn supports(&self, _capability: &str) -> Option<bool> {
        None
    }

    /// Human readable description used in logs
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Result of asking for the native object behind a pool abstraction
#[derive(Debug)]
pub enum Native<T> {
    /// The native object is reachable
    Available(T),
    /// It is not, with the reason
    Unsupported(&'static str),
}

impl<T> Native<T> {
    /// Whether the native object is reachable
    pub fn is_available(&self) -> bool {
        matches!(self, Native::Available(_))
    }

    /// Convert into a `Result`, mapping `Unsupported` to
    /// [`PoolError::NotSupported`](crate::PoolError::NotSupported)
    pub fn into_result(self) -> Result<T> {
        match self {
            Native::Available(value) => Ok(value),
            Native::Unsupported(reason) => Err(crate::PoolError::NotSupported(reason.to_string())),
        }
    }

    /// The native object, if reachable
    pub fn ok(self) -> Option<T> {
        match self {
            Native::Available(value) => Some(value),
            Native::Unsupported(_) => None,
        }
    }
}
