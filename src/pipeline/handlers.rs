//! Built-in downstream handlers selectable from configuration.

use bytes::BytesMut;

use crate::config::HandlerConfig;
use crate::pipeline::chain::{ByteHandler, HandlerContext};

/// Writes every read back to the peer.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl ByteHandler for EchoHandler {
    fn read(&mut self, ctx: &mut HandlerContext, data: BytesMut) {
        ctx.write(&data);
    }
}

/// Sends a fixed message on activation, then closes.
#[derive(Debug)]
pub struct BannerHandler {
    message: String,
}

impl BannerHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl ByteHandler for BannerHandler {
    fn transport_active(&mut self, ctx: &mut HandlerContext) {
        ctx.write(self.message.as_bytes());
        ctx.close();
    }

    fn read(&mut self, _ctx: &mut HandlerContext, _data: BytesMut) {}
}

/// Swallows all input.
#[derive(Debug, Default)]
pub struct DiscardHandler {
    discarded: usize,
}

impl ByteHandler for DiscardHandler {
    fn read(&mut self, _ctx: &mut HandlerContext, data: BytesMut) {
        self.discarded += data.len();
    }

    fn transport_inactive(&mut self, ctx: &mut HandlerContext) {
        tracing::trace!(peer_addr = ?ctx.peer_addr(), bytes = self.discarded, "Discarded input");
    }
}

/// Instantiate the handler a route is configured with.
pub fn from_config(config: &HandlerConfig) -> Box<dyn ByteHandler> {
    match config {
        HandlerConfig::Echo => Box::new(EchoHandler),
        HandlerConfig::Banner { message } => Box::new(BannerHandler::new(message.clone())),
        HandlerConfig::Discard => Box::new(DiscardHandler::default()),
    }
}
