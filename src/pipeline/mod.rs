//! Downstream pipelines attached after routing.
//!
//! # Data Flow
//! ```text
//! routing key
//!     → factory.rs (DownstreamPipelineFactory::build)
//!     → chain.rs (DownstreamChain wrapping one ByteHandler)
//!     → handlers.rs (echo, banner, discard)
//! ```
//!
//! Handlers never touch the socket. They queue writes and close requests on
//! a `HandlerContext`; the connection task applies them.

pub mod chain;
pub mod factory;
pub mod handlers;

pub use chain::{ByteHandler, DownstreamChain, HandlerContext};
pub use factory::{DownstreamPipelineFactory, RouteTableFactory};
