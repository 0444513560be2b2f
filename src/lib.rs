//! # mvent - Shared Memory Event System
//!
//! mvent is a shared-memory inter-process communication system built
//! from two primitives: a named, persistent key-value pool backed by a
//! memory-mapped file (with TTL and optional encryption), and a
//! change-watching event dispatcher layered on top. Streams, room
//! sockets, and an HTTP-like router derive their semantics entirely
//! from those two.
//!
//! ## Features
//!
//! - **Named shared pools**: file-backed, attachable from any process
//! - **TTL expiry**: background sweep plus read-time evaluation
//! - **Change watching**: snapshot-diff polling, coalesced at-most-once
//!   dispatch per observed change in every attached process
//! - **Optional encryption**: authenticated AES-256-GCM around encoded
//!   values
//! - **Derived channels**: monotonic-sequence streams, multi-room
//!   sockets, request/response rendezvous
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │    EventHandle │ StreamChannel │ Rooms │ Router  │
//! ├──────────────────────────────────────────────────┤
//! │   EventWatcher (poll + dispatch, per process)    │
//! ├──────────────────────────────────────────────────┤
//! │   SharedPool (encode → encrypt → frame log)      │
//! ├──────────────────────────────────────────────────┤
//! │   mmap'd backing file + advisory file lock       │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! The backing file is the sole shared mutable state and the advisory
//! file lock the sole cross-process synchronizer; there is no broker.

// Core modules
pub mod crypto;
pub mod error;
pub mod handle;
pub mod lock;
pub mod pool;
pub mod rooms;
pub mod router;
pub mod stream;
pub mod value;
pub mod watcher;

mod worker;

// Main API re-exports
pub use error::{MventError, Result};
pub use handle::EventHandle;
pub use pool::{EntryMeta, ErrorSink, PoolConfig, PoolStats, SharedPool};
pub use rooms::RoomSockets;
pub use router::{HttpRouter, Request, RouteHandler};
pub use stream::{StreamChannel, StreamStats, StreamSubscription};
pub use value::{decode_value, encode_value, Value};
pub use watcher::{EventWatcher, Subscription, WeakEventWatcher};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Default pool capacity (1 MiB)
    pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

    /// Smallest accepted pool capacity
    pub const MIN_CAPACITY: usize = 1024;

    /// Default TTL sweep cadence
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

    /// Default watcher poll cadence
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Default router remote response wait
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default router request record TTL
    pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);
}
