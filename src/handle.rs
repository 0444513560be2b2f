//! Ergonomic subscribe/emit facade bound to one pool

use std::time::Duration;

use crate::error::Result;
use crate::pool::{PoolConfig, SharedPool};
use crate::value::Value;
use crate::watcher::{EventWatcher, Subscription};

/// Combines a pool, its watcher, and subscription management behind a
/// small event-style API
///
/// ```no_run
/// use mvent::{EventHandle, Value};
///
/// let events = EventHandle::new("example_pool")?;
/// let _sub = events.on("user_data", |value| {
///     println!("user data changed: {:?}", value);
/// })?;
/// events.emit("user_data", &Value::map([("name", Value::from("John"))]), None)?;
/// # Ok::<(), mvent::MventError>(())
/// ```
pub struct EventHandle {
    pool: SharedPool,
    watcher: EventWatcher,
}

impl EventHandle {
    /// Open (or attach to) a named pool with default configuration and
    /// start watching it
    pub fn new(pool_name: impl Into<String>) -> Result<Self> {
        Self::with_config(PoolConfig::new(pool_name))
    }

    /// Open a pool with explicit configuration and start watching it
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        let pool = SharedPool::open(config)?;
        let watcher = EventWatcher::watch(pool.clone())?;
        Ok(Self { pool, watcher })
    }

    /// Attach to an already-open pool
    pub fn from_pool(pool: SharedPool) -> Result<Self> {
        let watcher = EventWatcher::watch(pool.clone())?;
        Ok(Self { pool, watcher })
    }

    /// The underlying pool
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// The underlying watcher
    pub fn watcher(&self) -> &EventWatcher {
        &self.watcher
    }

    /// Register a callback for an event; the returned subscription
    /// unsubscribes when dropped
    pub fn on(
        &self,
        event: &str,
        callback: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.watcher.subscribe(event, callback)
    }

    /// Emit an event: store `value` under the event key, optionally with
    /// a TTL, waking subscribers in every attached process
    pub fn emit(&self, event: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        self.pool.set(event, value, ttl)
    }

    /// Read the current value of an event key, e.g. to seed state before
    /// subscribing
    pub fn get(&self, event: &str) -> Result<Option<Value>> {
        self.pool.get(event)
    }

    /// Stop the watcher (unsubscribing everything) and release the pool
    pub fn cleanup(&self) -> Result<()> {
        self.watcher.stop()?;
        self.pool.cleanup()
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("pool", &self.pool.name())
            .finish_non_exhaustive()
    }
}
