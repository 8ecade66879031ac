//! Routing data parsers.
//!
//! # Responsibilities
//! - Define the per-connection parser interface
//! - Provide the prefix sniffer used by the server binary
//!
//! # Design Decisions
//! - Parsers see the whole pending buffer on every call, not just the new chunk
//! - A parser may consume a routing header with `split_to`; what remains is
//!   replayed into the downstream chain
//! - Parsers run while the registry entry is locked and must not call back
//!   into the router

use arc_swap::ArcSwap;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::RoutingError;
use crate::net::connection::ConnectionId;
use crate::routing::table::RouteTable;

/// Result of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<K> {
    /// Not enough bytes yet to decide.
    NeedMoreData,
    /// Routing key determined.
    Ready(K),
}

/// Identity of the connection a parser serves.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
}

/// Per-connection incremental routing key extractor.
pub trait RoutingDataParser<K>: Send + Sync {
    /// Called once when the connection becomes active.
    fn transport_active(&mut self, _ctx: &ConnectionContext) {}

    /// Inspect everything received so far.
    ///
    /// Must be deterministic for identical byte sequences. Any error is
    /// terminal for the connection.
    ///
    /// Runs with the connection's registry shard write-locked: a teardown
    /// from another thread, and any registry access hashing to the same
    /// shard, waits until this returns. Implementations must not block or
    /// do I/O.
    fn parse_routing_data(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome<K>, RoutingError>;

    /// A transport-level error arrived while routing was pending.
    /// Diagnostics only; the router performs cleanup.
    fn read_exception(&mut self, _err: &RoutingError) {}
}

/// Creates one parser per accepted connection.
pub trait RoutingDataParserFactory<K>: Send + Sync {
    fn new_parser(&self, ctx: &ConnectionContext) -> Box<dyn RoutingDataParser<K>>;
}

impl<K, F> RoutingDataParserFactory<K> for F
where
    F: Fn(&ConnectionContext) -> Box<dyn RoutingDataParser<K>> + Send + Sync,
{
    fn new_parser(&self, ctx: &ConnectionContext) -> Box<dyn RoutingDataParser<K>> {
        self(ctx)
    }
}

/// Routes a connection by matching its first bytes against route prefixes.
///
/// The longest matching prefix wins. While a longer prefix could still match
/// the parser waits for more data.
#[derive(Debug)]
pub struct PrefixParser {
    table: Arc<RouteTable>,
    connection: Option<ConnectionId>,
}

impl PrefixParser {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self {
            table,
            connection: None,
        }
    }
}

impl RoutingDataParser<String> for PrefixParser {
    fn transport_active(&mut self, ctx: &ConnectionContext) {
        self.connection = Some(ctx.id);
    }

    fn parse_routing_data(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome<String>, RoutingError> {
        let data = &buf[..];
        let mut matched: Option<&str> = None;
        let mut longer_possible = false;

        for (prefix, name) in self.table.prefixes() {
            if data.starts_with(prefix) {
                if matched.is_none() {
                    matched = Some(name.as_str());
                }
            } else if prefix.starts_with(data) {
                // Strict prefix of a candidate; more bytes could still select it.
                longer_possible = true;
            }
        }

        if longer_possible {
            return Ok(ParseOutcome::NeedMoreData);
        }
        if let Some(name) = matched {
            return Ok(ParseOutcome::Ready(name.to_string()));
        }
        if let Some(default) = self.table.default_route() {
            return Ok(ParseOutcome::Ready(default.to_string()));
        }

        Err(RoutingError::Parse(format!(
            "no route prefix matches {} leading bytes",
            data.len().min(16)
        )))
    }

    fn read_exception(&mut self, err: &RoutingError) {
        if let Some(id) = self.connection {
            tracing::debug!(connection_id = %id, error = %err, "Prefix sniffing aborted");
        }
    }
}

/// Hands each new connection a [`PrefixParser`] over the current route table.
#[derive(Debug, Clone)]
pub struct PrefixParserFactory {
    table: Arc<ArcSwap<RouteTable>>,
}

impl PrefixParserFactory {
    pub fn new(table: Arc<ArcSwap<RouteTable>>) -> Self {
        Self { table }
    }
}

impl RoutingDataParserFactory<String> for PrefixParserFactory {
    fn new_parser(&self, _ctx: &ConnectionContext) -> Box<dyn RoutingDataParser<String>> {
        Box::new(PrefixParser::new(self.table.load_full()))
    }
}
