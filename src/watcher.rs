//! Change detection and callback dispatch over a shared pool
//!
//! Every attached process that wants callbacks runs one watcher per
//! pool. The poll loop diffs pool snapshots against its baseline and
//! enqueues one event per observed change; a separate dispatch worker
//! invokes subscriber callbacks so a slow handler never stalls change
//! detection. Delivery is at-most-once per observed change: rapid
//! writes between polls coalesce into one event carrying the latest
//! value, and a disappearance (delete, expiry, clear) is delivered as
//! `None`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};

use crate::error::{MventError, Result};
use crate::pool::SharedPool;
use crate::value::Value;
use crate::worker::{Worker, JOIN_WAIT};

/// Consecutive transient poll failures before the error sink is notified
const ESCALATE_AFTER: u32 = 5;

/// Callback bound to a single key
pub type EventCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Callback bound to a key prefix; receives the concrete key
pub type KeyedCallback = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

enum SubscriberKind {
    Exact(String, EventCallback),
    Prefix(String, KeyedCallback),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, SubscriberKind)>,
}

impl Registry {
    fn add(&mut self, kind: SubscriberKind) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.push((id, kind));
        id
    }

    fn remove(&mut self, id: u64) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    fn interested(&self, key: &str) -> bool {
        self.subscribers.iter().any(|(_, kind)| match kind {
            SubscriberKind::Exact(k, _) => k == key,
            SubscriberKind::Prefix(p, _) => key.starts_with(p.as_str()),
        })
    }

    /// Clone the callbacks matching `key` so they run without the lock
    fn matching(&self, key: &str) -> Vec<SubscriberMatch> {
        self.subscribers
            .iter()
            .filter_map(|(_, kind)| match kind {
                SubscriberKind::Exact(k, cb) if k == key => {
                    Some(SubscriberMatch::Exact(Arc::clone(cb)))
                }
                SubscriberKind::Prefix(p, cb) if key.starts_with(p.as_str()) => {
                    Some(SubscriberMatch::Prefix(Arc::clone(cb)))
                }
                _ => None,
            })
            .collect()
    }
}

enum SubscriberMatch {
    Exact(EventCallback),
    Prefix(KeyedCallback),
}

struct ChangeEvent {
    key: String,
    value: Option<Value>,
}

struct WatcherInner {
    pool: SharedPool,
    registry: Arc<Mutex<Registry>>,
    queue_tx: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    poller: Mutex<Option<Worker>>,
    dispatcher: Mutex<Option<Worker>>,
    stopped: AtomicBool,
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.poller.lock().unwrap().take() {
            worker.stop(JOIN_WAIT);
        }
        self.queue_tx.lock().unwrap().take();
        if let Some(worker) = self.dispatcher.lock().unwrap().take() {
            worker.stop(JOIN_WAIT);
        }
    }
}

/// Watches one pool for changes and dispatches subscriber callbacks
#[derive(Clone)]
pub struct EventWatcher {
    inner: Arc<WatcherInner>,
}

impl EventWatcher {
    /// Start watching a pool
    ///
    /// The current pool contents become the comparison baseline, so
    /// already-present values are not replayed to new subscribers; call
    /// [`SharedPool::get`] to seed state instead.
    pub fn watch(pool: SharedPool) -> Result<Self> {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let baseline = pool.snapshot()?;
        let (queue_tx, queue_rx) = mpsc::channel::<ChangeEvent>();

        let dispatcher = {
            let registry = Arc::clone(&registry);
            Worker::spawn_task("mvent-dispatch", move || {
                while let Ok(event) = queue_rx.recv() {
                    dispatch(&registry, event);
                }
            })?
        };

        let poller = {
            let pool = pool.clone();
            let registry = Arc::clone(&registry);
            let tx = queue_tx.clone();
            let interval = pool.config().poll_interval;
            let error_sink = pool.config().error_sink.clone();
            let mut baseline = baseline;
            let mut failures = 0u32;
            Worker::spawn_periodic("mvent-poll", interval, move || {
                poll_tick(
                    &pool,
                    &registry,
                    &tx,
                    &mut baseline,
                    &mut failures,
                    error_sink.as_ref(),
                );
            })?
        };

        Ok(Self {
            inner: Arc::new(WatcherInner {
                pool,
                registry,
                queue_tx: Mutex::new(Some(queue_tx)),
                poller: Mutex::new(Some(poller)),
                dispatcher: Mutex::new(Some(dispatcher)),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// The pool this watcher observes
    pub fn pool(&self) -> &SharedPool {
        &self.inner.pool
    }

    /// Subscribe a callback to changes of one key
    ///
    /// The returned [`Subscription`] is the ownership token: dropping it
    /// unsubscribes. Duplicate subscriptions are allowed and each fires
    /// once per change.
    pub fn subscribe(
        &self,
        key: impl Into<String>,
        callback: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.register(SubscriberKind::Exact(key.into(), Arc::new(callback)))
    }

    /// Subscribe a callback to every key starting with `prefix`
    pub fn subscribe_prefix(
        &self,
        prefix: impl Into<String>,
        callback: impl Fn(&str, Option<Value>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.register(SubscriberKind::Prefix(prefix.into(), Arc::new(callback)))
    }

    fn register(&self, kind: SubscriberKind) -> Result<Subscription> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(MventError::Stopped);
        }
        let id = self.inner.registry.lock().unwrap().add(kind);
        Ok(Subscription {
            id,
            registry: Arc::downgrade(&self.inner.registry),
        })
    }

    /// Weak handle for callbacks that need the watcher itself; a strong
    /// handle inside a subscriber would keep the registry cycle alive
    pub fn downgrade(&self) -> WeakEventWatcher {
        WeakEventWatcher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop polling and dispatching; joins both workers with a bounded
    /// wait. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(worker) = self.inner.poller.lock().unwrap().take() {
            worker.stop(JOIN_WAIT);
        }
        // Dropping the sender lets the dispatcher drain and exit
        self.inner.queue_tx.lock().unwrap().take();
        if let Some(worker) = self.inner.dispatcher.lock().unwrap().take() {
            worker.stop(JOIN_WAIT);
        }
        self.inner.registry.lock().unwrap().subscribers.clear();
        Ok(())
    }
}

impl std::fmt::Debug for EventWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWatcher")
            .field("pool", &self.inner.pool.name())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Weak counterpart of [`EventWatcher`]
#[derive(Clone)]
pub struct WeakEventWatcher {
    inner: Weak<WatcherInner>,
}

impl WeakEventWatcher {
    /// Recover a strong handle if the watcher is still alive
    pub fn upgrade(&self) -> Option<EventWatcher> {
        self.inner.upgrade().map(|inner| EventWatcher { inner })
    }
}

/// Ownership token for a registered callback; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Explicitly unsubscribe
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap().remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn poll_tick(
    pool: &SharedPool,
    registry: &Arc<Mutex<Registry>>,
    tx: &mpsc::Sender<ChangeEvent>,
    baseline: &mut HashMap<String, u64>,
    failures: &mut u32,
    error_sink: Option<&crate::pool::ErrorSink>,
) {
    let snapshot = match pool.snapshot() {
        Ok(snapshot) => snapshot,
        // The pool is being torn down; the watcher will be stopped too
        Err(MventError::Stopped) => return,
        Err(err) if err.is_transient() => {
            *failures += 1;
            tracing::warn!(pool = %pool.name(), %err, failures = *failures, "poll failed, will retry");
            if *failures >= ESCALATE_AFTER {
                if let Some(sink) = error_sink {
                    sink(&err);
                }
                *failures = 0;
            }
            return;
        }
        Err(err) => {
            tracing::warn!(pool = %pool.name(), %err, "poll failed");
            if let Some(sink) = error_sink {
                sink(&err);
            }
            return;
        }
    };
    *failures = 0;

    let mut changed: Vec<String> = Vec::new();
    let mut removed: Vec<String> = Vec::new();
    {
        let registry = registry.lock().unwrap();
        for (key, version) in &snapshot {
            let is_new = baseline.get(key) != Some(version);
            if is_new && registry.interested(key) {
                changed.push(key.clone());
            }
        }
        for key in baseline.keys() {
            if !snapshot.contains_key(key) && registry.interested(key) {
                removed.push(key.clone());
            }
        }
    }
    *baseline = snapshot;

    for key in changed {
        // A change can expire before we read it; deliver the tombstone
        // now and forget the key so the next poll does not repeat it
        let value = match pool.get(&key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(pool = %pool.name(), key = %key, %err, "failed to read changed value");
                continue;
            }
        };
        if value.is_none() {
            baseline.remove(&key);
        }
        let _ = tx.send(ChangeEvent { key, value });
    }
    for key in removed {
        let _ = tx.send(ChangeEvent { key, value: None });
    }
}

fn dispatch(registry: &Arc<Mutex<Registry>>, event: ChangeEvent) {
    let matches = registry.lock().unwrap().matching(&event.key);
    for subscriber in matches {
        let outcome = match &subscriber {
            SubscriberMatch::Exact(cb) => {
                let value = event.value.clone();
                catch_unwind(AssertUnwindSafe(|| cb(value)))
            }
            SubscriberMatch::Prefix(cb) => {
                let value = event.value.clone();
                catch_unwind(AssertUnwindSafe(|| cb(&event.key, value)))
            }
        };
        if outcome.is_err() {
            tracing::warn!(key = %event.key, "subscriber callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_exact_and_prefix_matching() {
        let mut registry = Registry::default();
        let id1 = registry.add(SubscriberKind::Exact("user".into(), Arc::new(|_| {})));
        let _id2 = registry.add(SubscriberKind::Prefix("req/".into(), Arc::new(|_, _| {})));

        assert!(registry.interested("user"));
        assert!(registry.interested("req/greet/abc"));
        assert!(!registry.interested("users"));
        assert_eq!(registry.matching("user").len(), 1);

        registry.remove(id1);
        assert!(!registry.interested("user"));
    }

    #[test]
    fn test_duplicate_subscribers_each_match() {
        let mut registry = Registry::default();
        registry.add(SubscriberKind::Exact("k".into(), Arc::new(|_| {})));
        registry.add(SubscriberKind::Exact("k".into(), Arc::new(|_| {})));
        assert_eq!(registry.matching("k").len(), 2);
    }
}
