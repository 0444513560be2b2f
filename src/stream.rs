//! Monotonic-sequence pub/sub over a single pool key
//!
//! A stream is one pool entry holding `{seq, timestamp, data}`. Each
//! publish atomically increments `seq` under the file lock, so multiple
//! producers across processes never collide. Subscribers track the last
//! sequence they saw: stale redeliveries are dropped, and a gap larger
//! than one is counted as loss. Publishers never block on subscribers;
//! a slow subscriber skips intermediate values but always observes the
//! most recent one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::pool::SharedPool;
use crate::value::Value;
use crate::watcher::{EventWatcher, Subscription};

/// A pub/sub stream bound to one pool key
#[derive(Clone)]
pub struct StreamChannel {
    pool: SharedPool,
    watcher: EventWatcher,
    stream_key: String,
}

impl StreamChannel {
    /// Bind a stream to a pool key, using an existing watcher for
    /// subscriptions
    pub fn new(pool: SharedPool, watcher: EventWatcher, stream_key: impl Into<String>) -> Self {
        Self {
            pool,
            watcher,
            stream_key: stream_key.into(),
        }
    }

    /// The pool key backing this stream
    pub fn key(&self) -> &str {
        &self.stream_key
    }

    /// Publish a payload, returning the sequence number assigned to it
    ///
    /// The first publish on an absent key starts at sequence 1.
    pub fn publish(&self, payload: Value) -> Result<u64> {
        let timestamp = crate::pool::now_ns() as f64 / 1e9;
        let record = self.pool.update(&self.stream_key, None, |current| {
            let next = current
                .as_ref()
                .and_then(|v| v.get("seq"))
                .and_then(Value::as_int)
                .unwrap_or(0)
                + 1;
            Value::map([
                ("seq", Value::Int(next)),
                ("timestamp", Value::Float(timestamp)),
                ("data", payload),
            ])
        })?;
        Ok(record.get("seq").and_then(Value::as_int).unwrap_or(0) as u64)
    }

    /// Subscribe to future payloads
    ///
    /// The callback receives payloads in sequence order; values
    /// overwritten between watcher polls are skipped and counted in
    /// [`StreamSubscription::stats`].
    pub fn subscribe(
        &self,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<StreamSubscription> {
        let last_seq = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let seen = Arc::clone(&last_seq);
        let delivered_ctr = Arc::clone(&delivered);
        let dropped_ctr = Arc::clone(&dropped);
        let key = self.stream_key.clone();
        let subscription = self.watcher.subscribe(&self.stream_key, move |value| {
            // Disappearance of the stream entry is not a payload
            let Some(record) = value else { return };
            let Some(seq) = record.get("seq").and_then(Value::as_int) else {
                tracing::warn!(stream = %key, "stream record without a sequence number");
                return;
            };
            let seq = seq as u64;
            let prev = seen.load(Ordering::SeqCst);
            if seq <= prev {
                return;
            }
            if seq > prev + 1 {
                dropped_ctr.fetch_add(seq - prev - 1, Ordering::Relaxed);
            }
            seen.store(seq, Ordering::SeqCst);
            delivered_ctr.fetch_add(1, Ordering::Relaxed);
            if let Some(data) = record.get("data") {
                callback(data.clone());
            }
        })?;

        Ok(StreamSubscription {
            _subscription: subscription,
            delivered,
            dropped,
        })
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("key", &self.stream_key)
            .field("pool", &self.pool.name())
            .finish_non_exhaustive()
    }
}

/// Active stream subscription; unsubscribes when dropped
pub struct StreamSubscription {
    _subscription: Subscription,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl StreamSubscription {
    /// Delivery counters for this subscriber
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Explicitly unsubscribe
    pub fn cancel(self) {}
}

impl std::fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Per-subscriber delivery counters; `dropped` is the loss indicator
/// surfaced to monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Payloads handed to the callback
    pub delivered: u64,
    /// Sequence numbers skipped because newer ones overwrote them
    pub dropped: u64,
}
