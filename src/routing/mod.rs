//! Accept-time routing subsystem.
//!
//! # Data Flow
//! ```text
//! Connection active
//!     → router.rs creates a parser, registers RoutingState in registry.rs
//! Bytes arrive
//!     → state buffer grows → parser.rs inspects it
//!     → NeedMoreData: stay pending
//!     → Ready(key): registry entry removed, DownstreamPipelineFactory builds
//!       the chain, buffered bytes are replayed into it
//! Read error / EOF / reported error while pending
//!     → registry entry removed → parser notified → transport closed
//! ```
//!
//! # Design Decisions
//! - Routing state for a connection is released exactly once, whichever
//!   path gets there first
//! - Prefix routing is the built-in protocol; any key type works through
//!   `RoutingDataParser<K>`
//! - table.rs is immutable; reloads swap whole tables

pub mod parser;
pub mod registry;
pub mod router;
pub mod state;
pub mod table;

pub use parser::{
    ConnectionContext, ParseOutcome, PrefixParser, PrefixParserFactory, RoutingDataParser,
    RoutingDataParserFactory,
};
pub use registry::RoutingRegistry;
pub use router::{AcceptRouter, RouteStatus, RouterOptions};
pub use state::RoutingState;
pub use table::{Route, RouteTable};
