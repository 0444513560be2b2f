//! Background worker threads with bounded-join shutdown
//!
//! Sweeper, watcher poll loop, and dispatcher all follow the same
//! lifecycle: spawn, run until signalled, join with a bounded wait on
//! cleanup. A worker that fails to exit within the wait is abandoned
//! rather than blocking teardown.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{MventError, Result};

/// Maximum wait for a worker to acknowledge shutdown
pub(crate) const JOIN_WAIT: Duration = Duration::from_secs(2);

/// Handle to a background thread owned by a component
pub(crate) struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

impl Worker {
    /// Spawn a periodic worker that runs `tick` every `interval` until
    /// stopped
    pub fn spawn_periodic<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| MventError::from_io(e, "failed to spawn worker thread"))?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            stop_tx,
            done_rx,
        })
    }

    /// Spawn a worker that runs `task` to completion; the task is expected
    /// to exit on its own shutdown signal (e.g. a closed channel)
    pub fn spawn_task<F>(name: &str, task: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (stop_tx, _stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                task();
                let _ = done_tx.send(());
            })
            .map_err(|e| MventError::from_io(e, "failed to spawn worker thread"))?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            stop_tx,
            done_rx,
        })
    }

    /// Signal the worker and join it, abandoning it after `wait`
    pub fn stop(mut self, wait: Duration) {
        let _ = self.stop_tx.send(());
        match self.done_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(worker = %self.name, "worker did not stop in time, abandoning");
                self.handle.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_periodic_worker_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let worker = Worker::spawn_periodic("ticker", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        worker.stop(JOIN_WAIT);
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, saw {}", seen);
    }

    #[test]
    fn test_task_worker_joins_after_completion() {
        let (tx, rx) = mpsc::channel::<u32>();
        let worker = Worker::spawn_task("drainer", move || {
            while rx.recv().is_ok() {}
        })
        .unwrap();

        tx.send(1).unwrap();
        drop(tx);
        worker.stop(JOIN_WAIT);
    }
}
