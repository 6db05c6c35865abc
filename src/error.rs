//! Server Errors
//!
//! Failures that stop the server from starting or keep running. Errors
//! local to one connection never reach this type; the event loop logs them
//! and closes that connection.

use crate::poller::PollerError;
use std::io;
use thiserror::Error;

/// Errors surfaced by [`crate::Server`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind or listen on the configured address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Readiness multiplexer failure
    #[error("multiplexer error: {0}")]
    Poller(#[from] PollerError),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No connection slots left after reserving spare descriptors
    #[error("descriptor limit {limit} leaves no room for connections")]
    PoolExhausted { limit: usize },
}

impl ServerError {
    pub(crate) fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        ServerError::Bind {
            addr: addr.into(),
            source,
        }
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_message() {
        let err = ServerError::bind(
            "0.0.0.0:7070",
            io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        );
        assert_eq!(err.to_string(), "failed to bind 0.0.0.0:7070: in use");
    }

    #[test]
    fn test_poller_conversion() {
        let err: ServerError = PollerError::InvalidDescriptor(7).into();
        assert!(matches!(err, ServerError::Poller(_)));
    }
}
