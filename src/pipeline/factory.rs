//! Downstream pipeline construction.

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::error::RoutingError;
use crate::net::transport::TransportRef;
use crate::pipeline::chain::DownstreamChain;
use crate::pipeline::handlers;
use crate::routing::table::RouteTable;

/// Builds the handler chain for a routed connection.
///
/// Called on the connection's owning task. Failing is terminal for the
/// connection.
pub trait DownstreamPipelineFactory<K>: Send + Sync {
    fn build(&self, key: &K, transport: &TransportRef) -> Result<DownstreamChain, RoutingError>;
}

impl<K, F> DownstreamPipelineFactory<K> for F
where
    F: Fn(&K, &TransportRef) -> Result<DownstreamChain, RoutingError> + Send + Sync,
{
    fn build(&self, key: &K, transport: &TransportRef) -> Result<DownstreamChain, RoutingError> {
        self(key, transport)
    }
}

/// Builds chains from the configured route table.
///
/// The table is read at build time, so a route removed by a reload while a
/// connection was still pending fails construction for that connection.
#[derive(Debug, Clone)]
pub struct RouteTableFactory {
    table: Arc<ArcSwap<RouteTable>>,
}

impl RouteTableFactory {
    pub fn new(table: Arc<ArcSwap<RouteTable>>) -> Self {
        Self { table }
    }
}

impl DownstreamPipelineFactory<String> for RouteTableFactory {
    fn build(&self, key: &String, transport: &TransportRef) -> Result<DownstreamChain, RoutingError> {
        let table = self.table.load();
        let route = table
            .get(key)
            .ok_or_else(|| RoutingError::UnknownRoute(key.clone()))?;

        Ok(DownstreamChain::new(
            route.name.clone(),
            handlers::from_config(&route.handler),
            Arc::clone(transport),
        ))
    }
}
