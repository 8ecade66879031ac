//! Transport handles shared between a connection task and the router.
//!
//! The socket itself never leaves the connection task that owns it. What the
//! router, the pipeline factory, and out-of-band reporters hold is a
//! [`Transport`] handle: a way to ask the owning task to close the socket or to
//! process an error on its own loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::RoutingError;

/// Control surface of one accepted connection.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Remote address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Ask the owning task to close the connection. Idempotent.
    fn close(&self);

    /// Post an error into the owning task's loop.
    ///
    /// Hands the error back if the connection is already closed or its task
    /// is gone.
    fn post_error(&self, err: RoutingError) -> Result<(), RoutingError>;

    /// False once `close` has been requested.
    fn is_open(&self) -> bool;
}

/// Shared handle type used throughout the router.
pub type TransportRef = Arc<dyn Transport>;

/// Messages delivered to a connection task from outside its read path.
#[derive(Debug)]
pub enum ControlEvent {
    /// Close the socket; routing state (if any) has already been released.
    Close,
    /// An error reported from another context; the task runs teardown itself.
    Error(RoutingError),
}

/// [`Transport`] for a TCP connection driven by a tokio task.
#[derive(Debug)]
pub struct TcpTransport {
    peer_addr: SocketAddr,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    open: AtomicBool,
}

impl TcpTransport {
    /// Create a handle and the receiver the owning task must poll.
    pub fn new(peer_addr: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            peer_addr,
            control_tx,
            open: AtomicBool::new(true),
        });
        (transport, control_rx)
    }
}

impl Transport for TcpTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // Receiver gone means the task already finished.
            let _ = self.control_tx.send(ControlEvent::Close);
        }
    }

    fn post_error(&self, err: RoutingError) -> Result<(), RoutingError> {
        if !self.is_open() {
            return Err(err);
        }
        self.control_tx
            .send(ControlEvent::Error(err))
            .map_err(|mpsc::error::SendError(event)| match event {
                ControlEvent::Error(err) => err,
                ControlEvent::Close => RoutingError::Shutdown,
            })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
