//! Pool configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MventError, Result};

/// Callback receiving persistent background failures from sweeper and watcher
pub type ErrorSink = Arc<dyn Fn(&MventError) + Send + Sync>;

/// Configuration for opening a shared pool
#[derive(Clone)]
pub struct PoolConfig {
    /// Pool name; identifies the backing file
    pub name: String,
    /// Total capacity in bytes; ignored when the backing file already exists
    pub capacity: usize,
    /// Override for the backing directory; defaults to `<tempdir>/mvent`
    pub directory: Option<PathBuf>,
    /// Enables the encryption transformer when present
    pub encryption_key: Option<[u8; 32]>,
    /// TTL sweep cadence
    pub sweep_interval: Duration,
    /// Watcher poll cadence
    pub poll_interval: Duration,
    /// Max wait for the file lock; `None` blocks without bound
    pub lock_timeout: Option<Duration>,
    /// Router remote response wait
    pub call_timeout: Duration,
    /// Router request record TTL
    pub request_ttl: Duration,
    /// Receives persistent background failures
    pub error_sink: Option<ErrorSink>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            capacity: crate::config::DEFAULT_CAPACITY,
            directory: None,
            encryption_key: None,
            sweep_interval: crate::config::DEFAULT_SWEEP_INTERVAL,
            poll_interval: crate::config::DEFAULT_POLL_INTERVAL,
            lock_timeout: None,
            call_timeout: crate::config::DEFAULT_CALL_TIMEOUT,
            request_ttl: crate::config::DEFAULT_REQUEST_TTL,
            error_sink: None,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for a named pool
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the capacity used at first creation
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Override the backing directory
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Enable the encryption transformer
    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Set the TTL sweep cadence
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the watcher poll cadence
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound file lock acquisition
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Set the router remote response wait
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the router request record TTL
    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    /// Install an error sink for persistent background failures
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MventError::invalid_parameter(
                "name",
                "pool name cannot be empty",
            ));
        }
        if self.name.contains(['/', '\0']) {
            return Err(MventError::invalid_parameter(
                "name",
                "pool name cannot contain path separators or NUL",
            ));
        }
        if self.capacity < crate::config::MIN_CAPACITY {
            return Err(MventError::invalid_parameter(
                "capacity",
                format!("capacity must be at least {} bytes", crate::config::MIN_CAPACITY),
            ));
        }
        if self.sweep_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(MventError::invalid_parameter(
                "interval",
                "sweep and poll intervals must be non-zero",
            ));
        }
        Ok(())
    }

    /// Path of the backing file for this configuration
    pub fn backing_path(&self) -> PathBuf {
        let dir = self
            .directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mvent"));
        dir.join(format!("{}.pool", self.name))
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("directory", &self.directory)
            .field("encrypted", &self.encryption_key.is_some())
            .field("sweep_interval", &self.sweep_interval)
            .field("poll_interval", &self.poll_interval)
            .field("lock_timeout", &self.lock_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("request_ttl", &self.request_ttl)
            .finish_non_exhaustive()
    }
}
