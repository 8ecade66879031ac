//! Error definitions for the routing core.

use std::time::Duration;
use thiserror::Error;

use crate::net::connection::ConnectionId;

/// Errors observed while a connection is pending routing.
///
/// Every variant is terminal for the connection it concerns: routing is a
/// one-shot decision and is never retried.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Socket-level failure (reset, read error).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer closed the connection before a routing key was known.
    #[error("connection closed before routing data was complete")]
    Eof,

    /// The parser rejected the bytes it was given.
    #[error("unparseable routing data: {0}")]
    Parse(String),

    /// More bytes buffered than the configured limit while undecided.
    #[error("routing data exceeded {limit} bytes without a decision")]
    BufferLimit { limit: usize },

    /// The factory has no pipeline for this routing key.
    #[error("no downstream pipeline for routing key {0}")]
    UnknownRoute(String),

    /// The factory recognized the key but could not assemble the chain.
    #[error("downstream pipeline construction failed: {0}")]
    Construction(String),

    /// No routing decision within the configured deadline.
    #[error("routing timed out after {0:?}")]
    Timeout(Duration),

    /// Server is shutting down.
    #[error("server shutting down")]
    Shutdown,

    /// Error reported by a supervisory context outside the read path.
    #[error("{0}")]
    External(String),

    /// The accept layer handed out the same id twice.
    #[error("connection {0} is already pending routing")]
    DuplicateConnection(ConnectionId),
}

impl RoutingError {
    /// Short label used for logs and the `reason` metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::Transport(_) => "transport",
            RoutingError::Eof => "eof",
            RoutingError::Parse(_) => "parse",
            RoutingError::BufferLimit { .. } => "buffer_limit",
            RoutingError::UnknownRoute(_) => "unknown_route",
            RoutingError::Construction(_) => "construction",
            RoutingError::Timeout(_) => "timeout",
            RoutingError::Shutdown => "shutdown",
            RoutingError::External(_) => "external",
            RoutingError::DuplicateConnection(_) => "duplicate",
        }
    }

    /// True for the errors raised after a routing key was already known.
    pub fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            RoutingError::UnknownRoute(_) | RoutingError::Construction(_)
        )
    }
}
