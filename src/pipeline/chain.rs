//! Downstream handler chain.
//!
//! # Responsibilities
//! - Define the byte-stream handler interface used after routing
//! - Collect outbound bytes and close requests for the owning task to apply
//! - Guarantee `transport_inactive` is delivered at most once

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;

use crate::error::RoutingError;
use crate::net::transport::TransportRef;

/// A protocol handler attached to a connection once its routing key is known.
///
/// Handlers run on the connection's owning task and must not block.
pub trait ByteHandler: Send {
    /// Called once, before any replayed or live bytes.
    fn transport_active(&mut self, _ctx: &mut HandlerContext) {}

    /// Bytes received from the peer, in order.
    fn read(&mut self, ctx: &mut HandlerContext, data: BytesMut);

    /// Peer finished sending.
    fn read_eof(&mut self, ctx: &mut HandlerContext) {
        ctx.close();
    }

    /// Socket failure after routing.
    fn read_exception(&mut self, ctx: &mut HandlerContext, err: &RoutingError) {
        tracing::debug!(error = %err, "Downstream read failed");
        ctx.close();
    }

    /// Connection is gone. Called once, last.
    fn transport_inactive(&mut self, _ctx: &mut HandlerContext) {}
}

/// What a handler may do to its connection.
#[derive(Debug)]
pub struct HandlerContext {
    transport: TransportRef,
    outbound: BytesMut,
    close_requested: bool,
}

impl HandlerContext {
    fn new(transport: TransportRef) -> Self {
        Self {
            transport,
            outbound: BytesMut::new(),
            close_requested: false,
        }
    }

    /// Queue bytes for the peer. Flushed by the owning task after the event.
    pub fn write(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    /// Close after pending writes are flushed.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn transport(&self) -> &TransportRef {
        &self.transport
    }
}

/// The handler chain that owns a connection after routing.
pub struct DownstreamChain {
    name: String,
    handler: Box<dyn ByteHandler>,
    ctx: HandlerContext,
    active: bool,
    inactive: bool,
}

impl std::fmt::Debug for DownstreamChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamChain")
            .field("name", &self.name)
            .field("pending_outbound", &self.ctx.outbound.len())
            .field("closing", &self.ctx.close_requested)
            .finish()
    }
}

impl DownstreamChain {
    pub fn new(name: impl Into<String>, handler: Box<dyn ByteHandler>, transport: TransportRef) -> Self {
        Self {
            name: name.into(),
            handler,
            ctx: HandlerContext::new(transport),
            active: false,
            inactive: false,
        }
    }

    /// Name of the pipeline, used for logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport_active(&mut self) {
        if !self.active {
            self.active = true;
            self.handler.transport_active(&mut self.ctx);
        }
    }

    pub fn read(&mut self, data: BytesMut) {
        if data.is_empty() || self.inactive {
            return;
        }
        self.handler.read(&mut self.ctx, data);
    }

    pub fn read_eof(&mut self) {
        if !self.inactive {
            self.handler.read_eof(&mut self.ctx);
        }
    }

    pub fn read_exception(&mut self, err: &RoutingError) {
        if !self.inactive {
            self.handler.read_exception(&mut self.ctx, err);
        }
    }

    pub fn transport_inactive(&mut self) {
        if !self.inactive {
            self.inactive = true;
            self.handler.transport_inactive(&mut self.ctx);
        }
    }

    /// Drain bytes queued by the handler.
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.ctx.outbound.is_empty() {
            None
        } else {
            Some(self.ctx.outbound.split().freeze())
        }
    }

    /// True once the handler asked for the connection to close.
    pub fn is_closing(&self) -> bool {
        self.ctx.close_requested
    }
}
