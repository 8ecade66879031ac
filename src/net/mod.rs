//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (ConnectionId, lifecycle tracking)
//!     → transport.rs (handle shared with the router)
//!     → Hand off to the connection driver
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - The socket stays inside its task; everything else holds a Transport

pub mod connection;
pub mod listener;
pub mod transport;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use transport::{ControlEvent, TcpTransport, Transport, TransportRef};
