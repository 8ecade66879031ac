//! Per-connection routing state.

use bytes::BytesMut;
use std::time::Instant;

use crate::net::connection::ConnectionId;
use crate::net::transport::TransportRef;
use crate::routing::parser::RoutingDataParser;

/// Everything held for a connection while its routing key is undecided.
///
/// Owned by the registry while pending. Whoever removes it from the registry
/// owns it exclusively and is the only party allowed to act on it.
pub struct RoutingState<K> {
    pub(crate) id: ConnectionId,
    pub(crate) parser: Box<dyn RoutingDataParser<K>>,
    pub(crate) buffer: BytesMut,
    pub(crate) transport: TransportRef,
    pub(crate) accepted_at: Instant,
}

impl<K> RoutingState<K> {
    pub fn new(id: ConnectionId, parser: Box<dyn RoutingDataParser<K>>, transport: TransportRef) -> Self {
        Self {
            id,
            parser,
            buffer: BytesMut::new(),
            transport,
            accepted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

impl<K> std::fmt::Debug for RoutingState<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingState")
            .field("id", &self.id)
            .field("buffered", &self.buffer.len())
            .field("transport", &self.transport)
            .finish()
    }
}
