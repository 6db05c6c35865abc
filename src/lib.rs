//! # Sysmon - Host Information over HTTP
//!
//! Sysmon is a small single-threaded HTTP server that answers `GET`, `HEAD`
//! and `POST` requests with JSON documents describing the machine it runs
//! on: kernel identity, CPU counts and build facts.
//!
//! The interesting part is the I/O engine underneath. One thread drives every
//! connection through non-blocking sockets, a readiness multiplexer with
//! interchangeable OS backends, and a deadline scheduler that handles idle
//! eviction, write backoff and lingering close.
//!
//! ## Features
//!
//! - **Pluggable readiness backends**: `select`, `poll`, `epoll` and `kqueue`
//!   behind one interface, chosen at startup
//! - **Bounded resources**: a fixed connection pool sized from the process
//!   descriptor limit; accepts are deferred, never dropped, when it is full
//! - **Partial I/O everywhere**: incremental request framing, chunked
//!   vectored writes, backoff when a client reads slowly
//! - **Cached documents**: each endpoint is serialized once and refreshed on
//!   a timer, so serving a request never builds JSON
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                Server                                   │
//! │                                                                         │
//! │  ┌─────────────┐   ready fds   ┌──────────────────────────────────────┐ │
//! │  │ Multiplexer │──────────────>│ ConnectionPool                       │ │
//! │  │ select/poll │               │  ┌────────┐ ┌────────┐ ┌────────┐    │ │
//! │  │ epoll/kqueue│<──────────────│  │Reading │ │Sending │ │Pausing │... │ │
//! │  └─────────────┘ interest     │  └───┬────┘ └───┬────┘ └────────┘    │ │
//! │         ▲                      └──────┼──────────┼─────────────────────┘ │
//! │         │ timeout                     │          │                      │
//! │  ┌──────┴──────┐                      ▼          ▼                      │
//! │  │  Scheduler  │              ┌────────────┐ ┌──────────┐               │
//! │  │ 67 buckets  │              │ http parse │ │ Registry │               │
//! │  │ sweep/wake/ │              │ + canonical│ │ cached   │               │
//! │  │ linger/...  │              │   path     │ │ JSON     │               │
//! │  └─────────────┘              └────────────┘ └──────────┘               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sysmon::{Config, Server};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config { port: 8080, ..Config::default() };
//!     let mut server = Server::bind(config)?;
//!     server.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Endpoints
//!
//! - `/smver`: `{"major","minor","patch"}`
//! - `/uname`: `{"sysname","nodename","release","version","machine"}`
//! - `/cpu`: processor counts, word size and architecture
//! - `/info`: how the binary was built
//! - `/all`: every endpoint above under its own name
//!
//! ## Module Overview
//!
//! - [`poller`]: readiness multiplexer and its backends
//! - [`timer`]: hashed-bucket deadline scheduler
//! - [`http`]: request framing, parsing, path canonicalization, responses
//! - [`connection`]: per-connection state machine and the connection pool
//! - [`endpoints`]: JSON producers and the path registry
//! - [`server`]: the event loop
//! - [`config`]: command-line and environment configuration

pub mod config;
pub mod connection;
pub mod endpoints;
pub mod error;
pub mod http;
pub mod poller;
pub mod server;
pub mod timer;

// Re-export commonly used types for convenience
pub use config::Config;
pub use connection::{ConnState, Connection, ConnectionPool};
pub use endpoints::{Producer, Registry};
pub use error::{ServerError, ServerResult};
pub use http::{parse_request, Request, Response, StatusCode};
pub use poller::{BackendKind, Interest, Multiplexer, PollerError};
pub use server::{Server, ServerStats, TimerEvent};
pub use timer::{Scheduler, TimerHandle};

/// The default port sysmon listens on
pub const DEFAULT_PORT: u16 = 7070;

/// The default address sysmon binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of sysmon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
