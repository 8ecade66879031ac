//! Per-connection task.
//!
//! Each accepted socket is owned by exactly one task, which is its event
//! loop: socket reads, control events posted through its transport handle,
//! and the shutdown broadcast are all handled here, one at a time.
//!
//! # Phases
//! ```text
//! Pending:  read → AcceptRouter::on_bytes_received → Pending | Routed | Closed
//! Routed:   read → DownstreamChain::read → flush outbound
//! ```

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::RouterConfig;
use crate::error::RoutingError;
use crate::net::connection::ConnectionId;
use crate::net::transport::{ControlEvent, TcpTransport, TransportRef};
use crate::pipeline::chain::DownstreamChain;
use crate::routing::{AcceptRouter, RouteStatus};

/// Per-connection settings taken from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub read_buffer_size: usize,
    /// `None` disables the routing deadline.
    pub routing_timeout: Option<Duration>,
}

impl From<&RouterConfig> for DriverSettings {
    fn from(config: &RouterConfig) -> Self {
        let timeout_ms = config.routing.routing_timeout_ms;
        Self {
            read_buffer_size: config.listener.read_buffer_size.max(1),
            routing_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }
    }
}

enum Event {
    Read(std::io::Result<usize>),
    Control(Option<ControlEvent>),
    Shutdown,
}

/// Drives one connection from accept to close.
#[derive(Debug)]
pub struct ConnectionDriver<K> {
    router: AcceptRouter<K>,
    settings: DriverSettings,
}

impl<K> Clone for ConnectionDriver<K> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            settings: self.settings,
        }
    }
}

impl<K> ConnectionDriver<K>
where
    K: std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(router: AcceptRouter<K>, settings: DriverSettings) -> Self {
        Self { router, settings }
    }

    pub async fn run(
        &self,
        id: ConnectionId,
        mut stream: TcpStream,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        // A socket reset before we got here was never activated.
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "Connection failed before activation");
                return;
            }
        };

        let (transport, mut control_rx) = TcpTransport::new(peer);
        let transport: TransportRef = transport;
        if self
            .router
            .on_connection_active(id, Arc::clone(&transport))
            .is_err()
        {
            return;
        }

        let timer = self.spawn_routing_timer(id);
        let routed = self
            .route(id, &mut stream, &mut control_rx, &mut shutdown)
            .await;
        if let Some(timer) = timer {
            timer.abort();
        }

        if let Some(chain) = routed {
            self.serve(id, &mut stream, chain, &mut control_rx, &mut shutdown)
                .await;
        }

        transport.close();
        let _ = stream.shutdown().await;
        tracing::trace!(connection_id = %id, "Connection closed");
    }

    fn spawn_routing_timer(&self, id: ConnectionId) -> Option<JoinHandle<()>> {
        let timeout = self.settings.routing_timeout?;
        let router = self.router.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            router.report_error(id, RoutingError::Timeout(timeout));
        }))
    }

    /// Pending phase. Returns the chain if routing succeeded on this task.
    async fn route(
        &self,
        id: ConnectionId,
        stream: &mut TcpStream,
        control_rx: &mut mpsc::UnboundedReceiver<ControlEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<DownstreamChain> {
        let mut buf = BytesMut::with_capacity(self.settings.read_buffer_size);
        loop {
            buf.clear();
            buf.reserve(self.settings.read_buffer_size);

            let event = tokio::select! {
                read = stream.read_buf(&mut buf) => Event::Read(read),
                control = control_rx.recv() => Event::Control(control),
                _ = shutdown.recv() => Event::Shutdown,
            };

            match event {
                Event::Read(Ok(0)) => {
                    self.router.on_read_eof(id);
                    return None;
                }
                Event::Read(Ok(_)) => match self.router.on_bytes_received(id, &buf) {
                    RouteStatus::Pending => continue,
                    RouteStatus::Routed(chain) => return Some(chain),
                    RouteStatus::Closed | RouteStatus::NotPending => return None,
                },
                Event::Read(Err(e)) => {
                    self.router.on_read_error(id, e.into());
                    return None;
                }
                Event::Control(Some(ControlEvent::Error(err))) => {
                    self.router.on_external_error(id, err);
                    return None;
                }
                // Whoever closed the transport already released the state.
                Event::Control(Some(ControlEvent::Close) | None) => return None,
                Event::Shutdown => {
                    self.router.on_external_error(id, RoutingError::Shutdown);
                    return None;
                }
            }
        }
    }

    /// Routed phase: the chain owns the connection until it closes.
    async fn serve(
        &self,
        id: ConnectionId,
        stream: &mut TcpStream,
        mut chain: DownstreamChain,
        control_rx: &mut mpsc::UnboundedReceiver<ControlEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        tracing::trace!(connection_id = %id, pipeline = chain.name(), "Serving routed connection");
        let mut buf = BytesMut::with_capacity(self.settings.read_buffer_size);
        let mut done = false;
        while !done {
            if let Err(e) = flush(stream, &mut chain).await {
                tracing::debug!(connection_id = %id, error = %e, "Write failed");
                chain.read_exception(&RoutingError::Transport(e));
                break;
            }
            if chain.is_closing() {
                break;
            }

            buf.reserve(self.settings.read_buffer_size);
            let event = tokio::select! {
                read = stream.read_buf(&mut buf) => Event::Read(read),
                control = control_rx.recv() => Event::Control(control),
                _ = shutdown.recv() => Event::Shutdown,
            };

            match event {
                Event::Read(Ok(0)) => {
                    chain.read_eof();
                    done = true;
                }
                Event::Read(Ok(_)) => chain.read(buf.split()),
                Event::Read(Err(e)) => {
                    chain.read_exception(&RoutingError::Transport(e));
                    done = true;
                }
                // Only pending connections get reports. One arriving here was
                // posted before routing won and is absorbed as stale.
                Event::Control(Some(ControlEvent::Error(err))) => {
                    self.router.on_external_error(id, err);
                }
                Event::Control(Some(ControlEvent::Close) | None) | Event::Shutdown => done = true,
            }

            if done {
                let _ = flush(stream, &mut chain).await;
            }
        }

        chain.transport_inactive();
    }
}

async fn flush(stream: &mut TcpStream, chain: &mut DownstreamChain) -> std::io::Result<()> {
    while let Some(out) = chain.take_outbound() {
        stream.write_all(&out).await?;
    }
    Ok(())
}
