//! Error types for connpool.
//!
//! Every fallible pool operation returns [`PoolError`]. The variants follow the
//! lifecycle of a borrow: configuration problems are fatal at construction,
//! creation failures and exhaustion are surfaced to the borrowing caller, and
//! misuse of a released handle is reported immediately.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for connpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Boxed error produced by a driver or connection factory.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for connpool.
#[derive(Error, Debug)]
pub enum PoolError {
    // ========================================================================
    // Construction Errors
    // ========================================================================
    /// Pool tuning parameters violate an invariant.
    #[error("Invalid pool configuration: {0}")]
    Configuration(String),

    /// A configuration file could not be read or parsed.
    #[error("Failed to load pool configuration from '{path}': {message}")]
    ConfigLoad {
        /// Path to the configuration file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// `init()` was called on a pool whose core already exists.
    #[error("Pool already initialized")]
    AlreadyInitialized,

    // ========================================================================
    // Borrow Errors
    // ========================================================================
    /// The factory failed to open a physical connection.
    #[error("Failed to create connection: {message}")]
    ConnectionCreate {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxError>,
    },

    /// No capacity was freed before the borrow timeout elapsed.
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller waited
        waited: Duration,
    },

    /// The pool is shutting down or has been shut down.
    #[error("Connection pool is closed")]
    PoolClosed,

    // ========================================================================
    // Handle Errors
    // ========================================================================
    /// Operation attempted on a released or reclaimed connection handle.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A passthrough operation failed inside the driver.
    #[error("Driver operation failed: {source}")]
    Driver {
        /// Source error
        #[source]
        source: BoxError,
    },

    /// The underlying factory or connection does not provide the capability.
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl PoolError {
    /// Create a connection creation error from any driver error.
    pub fn create<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        let source = error.into();
        Self::ConnectionCreate {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a connection creation error with only a message.
    pub fn create_msg(message: impl Into<String>) -> Self {
        Self::ConnectionCreate {
            message: message.into(),
            source: None,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. } | PoolError::ConnectionCreate { .. }
        )
    }

    /// Whether the error is permanent for this pool instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::Configuration(_)
                | PoolError::ConfigLoad { .. }
                | PoolError::PoolClosed
                | PoolError::AlreadyInitialized
        )
    }
}
