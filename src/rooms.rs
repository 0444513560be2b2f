//! Socket-shaped multi-room pub/sub
//!
//! A thin multiplexer over [`StreamChannel`]: each room is a stream on
//! the key `room/<name>`. There is no central registry; joining a room
//! is exactly subscribing to its stream, and any attached process can
//! send to a room it never joined.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::pool::SharedPool;
use crate::stream::{StreamChannel, StreamSubscription};
use crate::value::Value;
use crate::watcher::EventWatcher;

/// In-memory sockets abstraction for inter-process message exchange
pub struct RoomSockets {
    pool: SharedPool,
    watcher: EventWatcher,
    rooms: Mutex<HashMap<String, StreamChannel>>,
    subscriptions: Mutex<Vec<(String, StreamSubscription)>>,
}

impl RoomSockets {
    /// Create a room multiplexer over a pool, starting its own watcher
    pub fn new(pool: SharedPool) -> Result<Self> {
        let watcher = EventWatcher::watch(pool.clone())?;
        Ok(Self {
            pool,
            watcher,
            rooms: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn channel(&self, room: &str) -> StreamChannel {
        self.rooms
            .lock()
            .unwrap()
            .entry(room.to_string())
            .or_insert_with(|| {
                StreamChannel::new(
                    self.pool.clone(),
                    self.watcher.clone(),
                    format!("room/{}", room),
                )
            })
            .clone()
    }

    /// Ensure a room exists; equivalent to binding its stream
    pub fn connect(&self, room: &str) {
        self.channel(room);
    }

    /// Subscribe a callback to messages sent to a room
    pub fn subscribe(
        &self,
        room: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<()> {
        let subscription = self.channel(room).subscribe(callback)?;
        self.subscriptions
            .lock()
            .unwrap()
            .push((room.to_string(), subscription));
        Ok(())
    }

    /// Publish a message to a room, returning its sequence number
    pub fn send(&self, room: &str, message: Value) -> Result<u64> {
        self.channel(room).publish(message)
    }

    /// Drop this process's subscriptions and binding for a room
    pub fn disconnect(&self, room: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|(name, _)| name != room);
        self.rooms.lock().unwrap().remove(room);
    }

    /// Drop all subscriptions and stop the watcher
    ///
    /// The pool handle was supplied by the caller and is not cleaned up.
    pub fn cleanup(&self) -> Result<()> {
        self.subscriptions.lock().unwrap().clear();
        self.rooms.lock().unwrap().clear();
        self.watcher.stop()
    }
}

impl std::fmt::Debug for RoomSockets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSockets")
            .field("pool", &self.pool.name())
            .field("rooms", &self.rooms.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}
