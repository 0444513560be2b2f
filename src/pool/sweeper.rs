//! Background TTL sweeper
//!
//! One sweeper thread per attached pool. Each tick acquires the write
//! lock and tombstones every live frame whose TTL has elapsed. Sweep is
//! best-effort; reads evaluate expiry themselves and never return a
//! stale value.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::worker::Worker;

use super::{now_ns, PoolInner};

/// Consecutive transient failures before the error sink is notified
const ESCALATE_AFTER: u32 = 5;

pub(crate) fn spawn(inner: &Arc<PoolInner>) -> Result<Worker> {
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let interval = inner.config.sweep_interval;
    let mut failures = 0u32;

    Worker::spawn_periodic("mvent-sweeper", interval, move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        match inner.locked(|store| store.sweep(now_ns())) {
            Ok(0) => failures = 0,
            Ok(swept) => {
                failures = 0;
                inner.expired_swept.fetch_add(swept as u64, Ordering::Relaxed);
                tracing::debug!(pool = %inner.config.name, swept, "swept expired entries");
            }
            // Teardown began between the stopped check and the lock
            Err(crate::error::MventError::Stopped) => {}
            Err(err) if err.is_transient() => {
                failures += 1;
                tracing::warn!(pool = %inner.config.name, %err, failures, "sweep failed, will retry");
                if failures >= ESCALATE_AFTER {
                    if let Some(sink) = &inner.config.error_sink {
                        sink(&err);
                    }
                    failures = 0;
                }
            }
            Err(err) => {
                tracing::warn!(pool = %inner.config.name, %err, "sweep failed");
                if let Some(sink) = &inner.config.error_sink {
                    sink(&err);
                }
            }
        }
    })
}
