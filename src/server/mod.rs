//! TCP front end for the accept router.
//!
//! # Data Flow
//! ```text
//! Listener::accept (permit held per connection)
//!     → ConnectionTracker::track (assigns ConnectionId)
//!     → spawned ConnectionDriver task
//!         → AcceptRouter (pending) → DownstreamChain (routed)
//! ```
//!
//! # Design Decisions
//! - The route table lives in an `ArcSwap` shared by the parser factory and
//!   the pipeline factory, so config reloads need no coordination
//! - Shutdown stops accepting first, then waits for tracked connections up
//!   to `drain_timeout_secs`

pub mod driver;

use arc_swap::ArcSwap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::config::RouterConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::pipeline::factory::RouteTableFactory;
use crate::routing::{AcceptRouter, PrefixParserFactory, RouteTable, RouterOptions};

pub use driver::{ConnectionDriver, DriverSettings};

/// Build a prefix-routing router over a shared route table.
pub fn prefix_router(table: Arc<ArcSwap<RouteTable>>, options: RouterOptions) -> AcceptRouter<String> {
    AcceptRouter::new(
        PrefixParserFactory::new(Arc::clone(&table)),
        RouteTableFactory::new(table),
        options,
    )
}

/// Accept loop plus connection bookkeeping.
pub struct RouterServer {
    table: Arc<ArcSwap<RouteTable>>,
    router: AcceptRouter<String>,
    driver: ConnectionDriver<String>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    drain_timeout: Duration,
}

impl RouterServer {
    pub fn new(config: &RouterConfig) -> Self {
        let table = Arc::new(ArcSwap::from_pointee(RouteTable::from_config(
            &config.routes,
            config.routing.default_route.clone(),
        )));
        let router = prefix_router(Arc::clone(&table), RouterOptions::from(&config.routing));
        let driver = ConnectionDriver::new(router.clone(), DriverSettings::from(config));

        Self {
            table,
            router,
            driver,
            tracker: ConnectionTracker::new(),
            shutdown: Shutdown::new(),
            drain_timeout: Duration::from_secs(config.listener.drain_timeout_secs),
        }
    }

    /// Shared route table; storing a new table affects later connections.
    pub fn route_table(&self) -> Arc<ArcSwap<RouteTable>> {
        Arc::clone(&self.table)
    }

    pub fn router(&self) -> AcceptRouter<String> {
        self.router.clone()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `signal` resolves, then drain.
    pub async fn run(
        self,
        listener: Listener,
        signal: impl Future<Output = ()>,
    ) -> Result<(), ListenerError> {
        tokio::pin!(signal);

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let guard = self.tracker.track();
                        let id = guard.id();
                        let driver = self.driver.clone();
                        let shutdown_rx = self.shutdown.subscribe();
                        let span = tracing::debug_span!("connection", connection_id = %id, %peer);
                        tokio::spawn(
                            async move {
                                driver.run(id, stream, shutdown_rx).await;
                                drop(permit);
                                drop(guard);
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => break Err(e),
                },
                _ = &mut signal => break Ok(()),
            }
        };

        drop(listener);
        self.shutdown.trigger();

        let active = self.tracker.active_count();
        tracing::info!(active, pending = self.router.pending_count(), "Draining connections");
        if self.tracker.wait_for_drain(self.drain_timeout).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain deadline passed, exiting with connections open"
            );
        }
        result
    }
}
