//! Pool configuration
//!
//! [`PoolConfig`] holds every tuning parameter the pool core reads. It is a plain
//! value: build it in code with the `with_*` setters, or load it from a file with
//! [`PoolConfig::load`], which merges:
//! - Default values
//! - A TOML, YAML or JSON file
//! - `CONNPOOL_*` environment variables
//!
//! and then runs [`PoolConfig::validate`]. Once a pool has been created from a
//! configuration it never changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{PoolError, Result};

/// Order in which idle connections are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleOrder {
    /// Most recently returned first.
    #[default]
    Lifo,
    /// Least recently returned first.
    Fifo,
}

/// Configuration for the connection pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept by eviction and backfilled by maintenance
    pub min_idle: usize,
    /// Maximum idle connections; extra returns are closed
    pub max_idle: usize,
    /// Hard cap on physical connections (idle + busy + being created)
    pub max_active: usize,
    /// How long a borrow waits for capacity (`None` waits forever)
    #[serde(with = "humantime_serde")]
    pub max_wait: Option<Duration>,
    /// Which idle connection a borrow receives
    pub idle_order: IdleOrder,
    /// Validate an idle connection before handing it out
    pub test_on_borrow: bool,
    /// Validate a connection when it is released
    pub test_on_return: bool,
    /// Validate idle connections during maintenance runs
    pub test_while_idle: bool,
    /// Upper bound on a single validation call. Zero is rejected since every
    /// validation would fail.
    #[serde(with = "humantime_serde")]
    pub validation_timeout: Option<Duration>,
    /// Period of the background maintenance task (`None` disables it)
    #[serde(with = "humantime_serde")]
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle age after which a connection may be evicted; zero makes every
    /// idle connection above `min_idle` eligible
    #[serde(with = "humantime_serde")]
    pub min_evictable_idle_time: Duration,
    /// Borrow age after which a busy connection is reclaimed (`None` disables,
    /// zero reclaims every borrow on the next run)
    #[serde(with = "humantime_serde")]
    pub remove_abandoned_timeout: Option<Duration>,
    /// Capture a backtrace at borrow time for abandonment diagnostics
    pub log_abandoned: bool,
    /// How long shutdown waits for busy connections to come back
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: 8,
            max_active: 8,
            max_wait: Some(Duration::from_secs(30)),
            idle_order: IdleOrder::Lifo,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            validation_timeout: Some(Duration::from_secs(5)),
            time_between_eviction_runs: None,
            min_evictable_idle_time: Duration::from_secs(1800), // 30 minutes
            remove_abandoned_timeout: None,
            log_abandoned: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values
    ///
    /// # Examples
    ///
    /// ```
    /// use connpool::PoolConfig;
    ///
    /// let config = PoolConfig::new();
    /// assert_eq!(config.max_active, 8);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of idle connections
    pub fn with_min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    /// Set the maximum number of idle connections
    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }

    /// Set the capacity of the pool
    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max;
        self
    }

    /// Set the borrow timeout (`None` waits forever)
    pub fn with_max_wait(mut self, wait: Option<Duration>) -> Self {
        self.max_wait = wait;
        self
    }

    /// Set the idle hand-out order
    pub fn with_idle_order(mut self, order: IdleOrder) -> Self {
        self.idle_order = order;
        self
    }

    /// Enable/disable validation before a borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Enable/disable validation on release
    pub fn with_test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }

    /// Enable/disable validation of idle connections during maintenance
    pub fn with_test_while_idle(mut self, test: bool) -> Self {
        self.test_while_idle = test;
        self
    }

    /// Set the validation timeout
    pub fn with_validation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set the maintenance period
    pub fn with_time_between_eviction_runs(mut self, period: Option<Duration>) -> Self {
        self.time_between_eviction_runs = period;
        self
    }

    /// Set the idle age that makes a connection evictable
    pub fn with_min_evictable_idle_time(mut self, idle: Duration) -> Self {
        self.min_evictable_idle_time = idle;
        self
    }

    /// Set the abandonment timeout
    pub fn with_remove_abandoned_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.remove_abandoned_timeout = timeout;
        self
    }

    /// Enable/disable borrow-site backtraces
    pub fn with_log_abandoned(mut self, log: bool) -> Self {
        self.log_abandoned = log;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Create a production-ready configuration
    pub fn production() -> Self {
        Self {
            min_idle: 2,
            max_idle: 10,
            max_active: 20,
            max_wait: Some(Duration::from_secs(30)),
            test_on_borrow: true,
            test_while_idle: true,
            time_between_eviction_runs: Some(Duration::from_secs(30)),
            min_evictable_idle_time: Duration::from_secs(600),
            remove_abandoned_timeout: Some(Duration::from_secs(300)),
            ..Self::default()
        }
    }

    /// Create a development configuration (smaller pool, abandonment traces on)
    pub fn development() -> Self {
        Self {
            min_idle: 0,
            max_idle: 2,
            max_active: 5,
            max_wait: Some(Duration::from_secs(10)),
            time_between_eviction_runs: Some(Duration::from_secs(10)),
            min_evictable_idle_time: Duration::from_secs(60),
            remove_abandoned_timeout: Some(Duration::from_secs(60)),
            log_abandoned: true,
            ..Self::default()
        }
    }

    /// Check the invariants `min_idle <= max_idle <= max_active` and the timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(PoolError::Configuration(
                "max_active must be greater than zero".to_string(),
            ));
        }
        if self.min_idle > self.max_idle {
            return Err(PoolError::Configuration(format!(
                "min_idle ({}) must be <= max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.max_idle > self.max_active {
            return Err(PoolError::Configuration(format!(
                "max_idle ({}) must be <= max_active ({})",
                self.max_idle, self.max_active
            )));
        }
        if self.validation_timeout == Some(Duration::ZERO) {
            return Err(PoolError::Configuration(
                "validation_timeout must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Maintenance period, or `None` when the background task is disabled
    pub fn maintenance_period(&self) -> Option<Duration> {
        self.time_between_eviction_runs.filter(|p| !p.is_zero())
    }

    /// Load, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file (TOML, YAML or JSON by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PoolError::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
            "json" => serde_json::from_str(&content).map_err(|e| e.to_string()),
            "toml" => toml::from_str(&content).map_err(|e| e.to_string()),
            _ => toml::from_str(&content)
                .or_else(|_| serde_yaml::from_str(&content))
                .map_err(|e| e.to_string()),
        };

        parsed.map_err(|message| PoolError::ConfigLoad {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Apply `CONNPOOL_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("CONNPOOL_MAX_ACTIVE") {
            self.max_active = v;
        }
        if let Some(v) = env_parse::<usize>("CONNPOOL_MIN_IDLE") {
            self.min_idle = v;
        }
        if let Some(v) = env_parse::<usize>("CONNPOOL_MAX_IDLE") {
            self.max_idle = v;
        }
        // Negative values mean "wait forever"
        if let Some(v) = env_parse::<i64>("CONNPOOL_MAX_WAIT_MS") {
            self.max_wait = u64::try_from(v).ok().map(Duration::from_millis);
        }
        if let Some(v) = env_parse::<bool>("CONNPOOL_TEST_ON_BORROW") {
            self.test_on_borrow = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
