//! Connection Pool & State Machine
//!
//! Every accepted socket lives in a slot of a fixed-size [`ConnectionPool`]
//! and moves through a small state machine driven by readiness events and
//! timers.
//!
//! ## States
//!
//! ```text
//!            accept
//!   Free ─────────────► Reading ──bad request / EOF / idle──► Free
//!                          │
//!                          │ request complete
//!                          ▼
//!          ┌────────── Sending ◄──────────┐
//!          │              │               │ wakeup timer
//!          │ would block  │ all sent      │
//!          ▼              ▼               │
//!       Pausing ─────► Free or ─────── Pausing
//!                      Lingering ──EOF / linger timer──► Free
//! ```
//!
//! Registration follows the state: Reading and Lingering watch for reads,
//! Sending watches for writes, Pausing watches nothing.
//!
//! ## Example
//!
//! ```ignore
//! use sysmon::connection::{Buffers, Connection, ConnectionPool};
//!
//! let mut pool = ConnectionPool::new(1024);
//! let id = pool.insert_with(|buffers| {
//!     Connection::new(stream, peer, now, backoff_increment, buffers)
//! });
//! ```

pub mod handler;
pub mod pool;

use std::fmt;

// Re-export commonly used types
pub use handler::{
    Backoff, Buffers, Connection, ConnectionError, ReadEvent, WriteProgress, INITIAL_BUFFER_SIZE,
    MAX_REQUEST_SIZE, MAX_WRITE_CHUNK,
};
pub use pool::{ConnId, ConnectionPool};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Free,
    Reading,
    Sending,
    Pausing,
    Lingering,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Free => "free",
            ConnState::Reading => "reading",
            ConnState::Sending => "sending",
            ConnState::Pausing => "pausing",
            ConnState::Lingering => "lingering",
        };
        f.write_str(name)
    }
}
