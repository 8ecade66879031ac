//! Accept-time connection router.
//!
//! Sniffs the first bytes of each accepted connection, picks a downstream
//! pipeline from them, and hands the connection over with the sniffed bytes
//! replayed.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod routing;
pub mod server;

pub use config::RouterConfig;
pub use error::RoutingError;
pub use lifecycle::Shutdown;
pub use routing::{AcceptRouter, RouteStatus, RouterOptions};
pub use server::RouterServer;
