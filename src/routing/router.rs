//! Accept-time router.
//!
//! # Responsibilities
//! - Create and register routing state when a connection becomes active
//! - Drive the parser as bytes arrive
//! - Hand the connection to its downstream chain, replaying buffered bytes
//! - Tear the connection down on any failure while pending
//!
//! # Design Decisions
//! - `RoutingRegistry::remove` is the only authority on whether routing has
//!   concluded; every terminal path starts with it and stops if it lost
//! - Reports for connections that are no longer pending are absorbed silently
//!   unless `log_stale_reports` is set
//! - `report_error` posts into the owning task; `on_external_error` tears
//!   down directly and is safe from any thread
//! - Parsing happens under the registry entry lock, which serializes it
//!   against teardown from other threads; parsers must be short and
//!   non-blocking

use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::net::connection::ConnectionId;
use crate::net::transport::TransportRef;
use crate::observability::metrics;
use crate::pipeline::chain::DownstreamChain;
use crate::pipeline::factory::DownstreamPipelineFactory;
use crate::routing::parser::{ConnectionContext, ParseOutcome, RoutingDataParserFactory};
use crate::routing::registry::RoutingRegistry;
use crate::routing::state::RoutingState;

/// Tunables for the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOptions {
    /// Upper bound on bytes buffered while undecided. 0 disables the check.
    pub max_pending_bytes: usize,
    /// Log reports that arrive after a connection left Pending.
    pub log_stale_reports: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            max_pending_bytes: 64 * 1024,
            log_stale_reports: false,
        }
    }
}

impl From<&RoutingConfig> for RouterOptions {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            max_pending_bytes: config.max_pending_bytes,
            log_stale_reports: config.log_stale_reports,
        }
    }
}

/// What happened to a connection as a result of a data-path event.
#[derive(Debug)]
pub enum RouteStatus {
    /// Still undecided; bytes were buffered.
    Pending,
    /// Routing resolved. The chain has seen `transport_active` and the
    /// replayed buffer; the caller drives it from now on.
    Routed(DownstreamChain),
    /// This event tore the connection down.
    Closed,
    /// The connection was not pending (never activated, or already resolved).
    NotPending,
}

struct RouterInner<K> {
    registry: RoutingRegistry<K>,
    parsers: Box<dyn RoutingDataParserFactory<K>>,
    downstream: Box<dyn DownstreamPipelineFactory<K>>,
    options: RouterOptions,
}

/// Routes accepted connections to downstream chains. Cheap to clone.
pub struct AcceptRouter<K> {
    inner: Arc<RouterInner<K>>,
}

impl<K> Clone for AcceptRouter<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> std::fmt::Debug for AcceptRouter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptRouter")
            .field("pending", &self.inner.registry.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<K: std::fmt::Debug> AcceptRouter<K> {
    pub fn new(
        parsers: impl RoutingDataParserFactory<K> + 'static,
        downstream: impl DownstreamPipelineFactory<K> + 'static,
        options: RouterOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: RoutingRegistry::new(),
                parsers: Box::new(parsers),
                downstream: Box::new(downstream),
                options,
            }),
        }
    }

    /// Connection became active: create, register, and activate its parser.
    pub fn on_connection_active(&self, id: ConnectionId, transport: TransportRef) -> Result<(), RoutingError> {
        let ctx = ConnectionContext {
            id,
            peer_addr: transport.peer_addr(),
        };
        let parser = self.inner.parsers.new_parser(&ctx);

        if let Err(err) = self
            .inner
            .registry
            .insert(id, RoutingState::new(id, parser, transport))
        {
            tracing::error!(connection_id = %id, error = %err, "Connection registered twice");
            return Err(err);
        }
        self.inner
            .registry
            .with_state_mut(id, |state| state.parser.transport_active(&ctx));

        metrics::record_accepted();
        metrics::record_pending_added();
        tracing::debug!(
            connection_id = %id,
            peer_addr = ?ctx.peer_addr,
            "Connection pending routing"
        );
        Ok(())
    }

    /// Append bytes to the pending buffer and run the parser.
    pub fn on_bytes_received(&self, id: ConnectionId, bytes: &[u8]) -> RouteStatus {
        let limit = self.inner.options.max_pending_bytes;
        let outcome = self.inner.registry.with_state_mut(id, |state| -> Result<ParseOutcome<K>, RoutingError> {
            state.buffer.extend_from_slice(bytes);
            match state.parser.parse_routing_data(&mut state.buffer)? {
                ParseOutcome::NeedMoreData if limit > 0 && state.buffer.len() > limit => {
                    Err(RoutingError::BufferLimit { limit })
                }
                outcome => Ok(outcome),
            }
        });

        match outcome {
            None => {
                self.log_stale(id, "bytes received");
                RouteStatus::NotPending
            }
            Some(Ok(ParseOutcome::NeedMoreData)) => RouteStatus::Pending,
            Some(Ok(ParseOutcome::Ready(key))) => self.on_routing_data(id, key),
            Some(Err(err)) => {
                if self.teardown(id, err) {
                    RouteStatus::Closed
                } else {
                    RouteStatus::NotPending
                }
            }
        }
    }

    /// Routing key is known: release the state and build the downstream chain.
    pub fn on_routing_data(&self, id: ConnectionId, key: K) -> RouteStatus {
        let Some(state) = self.inner.registry.remove(id) else {
            self.log_stale(id, "routing data");
            return RouteStatus::NotPending;
        };
        metrics::record_pending_removed();

        let RoutingState {
            buffer,
            transport,
            accepted_at,
            ..
        } = state;

        match self.inner.downstream.build(&key, &transport) {
            Ok(mut chain) => {
                tracing::debug!(
                    connection_id = %id,
                    routing_key = ?key,
                    pipeline = chain.name(),
                    replayed_bytes = buffer.len(),
                    "Routing resolved"
                );
                metrics::record_routed(chain.name(), accepted_at);
                chain.transport_active();
                chain.read(buffer);
                RouteStatus::Routed(chain)
            }
            Err(err) => {
                tracing::error!(
                    connection_id = %id,
                    routing_key = ?key,
                    error = %err,
                    "Downstream pipeline construction failed"
                );
                metrics::record_teardown(err.kind());
                transport.close();
                RouteStatus::Closed
            }
        }
    }

    /// Socket error while pending. Returns `true` if this call tore down.
    pub fn on_read_error(&self, id: ConnectionId, err: RoutingError) -> bool {
        self.teardown(id, err)
    }

    /// Peer closed while pending. Returns `true` if this call tore down.
    pub fn on_read_eof(&self, id: ConnectionId) -> bool {
        self.teardown(id, RoutingError::Eof)
    }

    /// Error from outside the read path. Same teardown as `on_read_error`,
    /// callable from any thread.
    pub fn on_external_error(&self, id: ConnectionId, err: RoutingError) -> bool {
        self.teardown(id, err)
    }

    /// Post an error to the connection's owning task, which then calls
    /// `on_external_error` on its own loop.
    ///
    /// Falls back to tearing down here if the task can no longer receive it.
    /// Returns `false` if the connection was not pending.
    pub fn report_error(&self, id: ConnectionId, err: RoutingError) -> bool {
        let Some(transport) = self
            .inner
            .registry
            .lookup(id, |state| Arc::clone(&state.transport))
        else {
            if self.inner.options.log_stale_reports {
                tracing::debug!(connection_id = %id, error = %err, "Dropping report for connection no longer pending");
            }
            return false;
        };

        match transport.post_error(err) {
            Ok(()) => true,
            Err(err) => self.on_external_error(id, err),
        }
    }

    /// Number of connections currently pending routing.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn options(&self) -> &RouterOptions {
        &self.inner.options
    }

    fn teardown(&self, id: ConnectionId, err: RoutingError) -> bool {
        let Some(mut state) = self.inner.registry.remove(id) else {
            if self.inner.options.log_stale_reports {
                tracing::debug!(connection_id = %id, error = %err, "Connection no longer pending, ignoring");
            }
            return false;
        };
        metrics::record_pending_removed();

        state.parser.read_exception(&err);
        match &err {
            RoutingError::Eof | RoutingError::Shutdown => tracing::debug!(
                connection_id = %id,
                buffered = state.buffer.len(),
                reason = err.kind(),
                "Closing connection before routing"
            ),
            _ => tracing::warn!(
                connection_id = %id,
                buffered = state.buffer.len(),
                error = %err,
                "Routing failed, closing connection"
            ),
        }
        metrics::record_teardown(err.kind());
        state.transport.close();
        true
    }

    fn log_stale(&self, id: ConnectionId, event: &'static str) {
        if self.inner.options.log_stale_reports {
            tracing::debug!(connection_id = %id, event, "Connection no longer pending, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::Transport;
    use crate::pipeline::chain::{ByteHandler, HandlerContext};
    use bytes::BytesMut;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    #[derive(Debug)]
    struct MockTransport {
        open: AtomicBool,
        accept_posts: bool,
        closes: AtomicUsize,
        posted: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Self::with_posts(true)
        }

        fn with_posts(accept_posts: bool) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                accept_posts,
                closes: AtomicUsize::new(0),
                posted: Mutex::new(Vec::new()),
            })
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn post_error(&self, err: RoutingError) -> Result<(), RoutingError> {
            if !self.accept_posts {
                return Err(err);
            }
            self.posted.lock().unwrap().push(err.kind().to_string());
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct ParserCalls {
        created: AtomicUsize,
        transport_active: AtomicUsize,
        parses: AtomicUsize,
        exceptions: Mutex<Vec<&'static str>>,
    }

    /// Ready with key 'A' once `ready_after` bytes are buffered.
    struct ScriptedParser {
        calls: Arc<ParserCalls>,
        ready_after: Option<usize>,
        consume: usize,
        reject: Option<u8>,
    }

    impl crate::routing::parser::RoutingDataParser<char> for ScriptedParser {
        fn transport_active(&mut self, _ctx: &ConnectionContext) {
            self.calls.transport_active.fetch_add(1, Ordering::SeqCst);
        }

        fn parse_routing_data(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome<char>, RoutingError> {
            self.calls.parses.fetch_add(1, Ordering::SeqCst);
            if let Some(byte) = self.reject {
                if buf.contains(&byte) {
                    return Err(RoutingError::Parse("rejected byte".into()));
                }
            }
            match self.ready_after {
                Some(n) if buf.len() >= n => {
                    let _ = buf.split_to(self.consume);
                    Ok(ParseOutcome::Ready('A'))
                }
                _ => Ok(ParseOutcome::NeedMoreData),
            }
        }

        fn read_exception(&mut self, err: &RoutingError) {
            self.calls.exceptions.lock().unwrap().push(err.kind());
        }
    }

    #[derive(Default)]
    struct FactoryCalls {
        builds: AtomicUsize,
        events: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingHandler {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ByteHandler for RecordingHandler {
        fn transport_active(&mut self, _ctx: &mut HandlerContext) {
            self.events.lock().unwrap().push("active".into());
        }

        fn read(&mut self, _ctx: &mut HandlerContext, data: BytesMut) {
            let text = String::from_utf8_lossy(&data).into_owned();
            self.events.lock().unwrap().push(format!("read:{text}"));
        }

        fn read_eof(&mut self, ctx: &mut HandlerContext) {
            self.events.lock().unwrap().push("eof".into());
            ctx.close();
        }

        fn transport_inactive(&mut self, _ctx: &mut HandlerContext) {
            self.events.lock().unwrap().push("inactive".into());
        }
    }

    struct Setup {
        ready_after: Option<usize>,
        consume: usize,
        reject: Option<u8>,
        factory_fails: bool,
        options: RouterOptions,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                ready_after: Some(1),
                consume: 0,
                reject: None,
                factory_fails: false,
                options: RouterOptions {
                    max_pending_bytes: 1024,
                    log_stale_reports: true,
                },
            }
        }
    }

    struct Fixture {
        router: AcceptRouter<char>,
        parser: Arc<ParserCalls>,
        factory: Arc<FactoryCalls>,
    }

    impl Fixture {
        fn events(&self) -> Vec<String> {
            self.factory.events.lock().unwrap().clone()
        }

        fn builds(&self) -> usize {
            self.factory.builds.load(Ordering::SeqCst)
        }

        fn exceptions(&self) -> Vec<&'static str> {
            self.parser.exceptions.lock().unwrap().clone()
        }
    }

    fn fixture(setup: Setup) -> Fixture {
        let parser = Arc::new(ParserCalls::default());
        let factory = Arc::new(FactoryCalls::default());

        let parser_calls = Arc::clone(&parser);
        let Setup {
            ready_after,
            consume,
            reject,
            factory_fails,
            options,
        } = setup;
        let parsers = move |_ctx: &ConnectionContext| -> Box<dyn crate::routing::parser::RoutingDataParser<char>> {
            parser_calls.created.fetch_add(1, Ordering::SeqCst);
            Box::new(ScriptedParser {
                calls: Arc::clone(&parser_calls),
                ready_after,
                consume,
                reject,
            })
        };

        let factory_calls = Arc::clone(&factory);
        let downstream = move |key: &char, transport: &TransportRef| -> Result<DownstreamChain, RoutingError> {
            factory_calls.builds.fetch_add(1, Ordering::SeqCst);
            if factory_fails {
                return Err(RoutingError::Construction(format!("no pipeline for {key}")));
            }
            let handler = RecordingHandler {
                events: Arc::clone(&factory_calls.events),
            };
            Ok(DownstreamChain::new(key.to_string(), Box::new(handler), Arc::clone(transport)))
        };

        Fixture {
            router: AcceptRouter::new(parsers, downstream, options),
            parser,
            factory,
        }
    }

    fn io_error() -> RoutingError {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into()
    }

    #[test]
    fn parse_success_hands_off_and_clears_registry() {
        let fx = fixture(Setup::default());
        let id = ConnectionId::new();
        let transport = MockTransport::new();

        fx.router.on_connection_active(id, transport.clone()).unwrap();
        assert_eq!(fx.router.pending_count(), 1);
        assert_eq!(fx.parser.transport_active.load(Ordering::SeqCst), 1);

        let RouteStatus::Routed(mut chain) = fx.router.on_bytes_received(id, b"a") else {
            panic!("expected routed");
        };
        assert_eq!(fx.router.pending_count(), 0);

        // Client then closes cleanly.
        chain.read_eof();
        assert!(chain.is_closing());
        chain.transport_inactive();

        assert_eq!(fx.events(), vec!["active", "read:a", "eof", "inactive"]);
        assert_eq!(fx.builds(), 1);
        assert_eq!(transport.closes(), 0);
    }

    #[test]
    fn socket_error_while_pending_skips_downstream() {
        let fx = fixture(Setup {
            ready_after: None,
            ..Setup::default()
        });
        let id = ConnectionId::new();
        let transport = MockTransport::new();

        fx.router.on_connection_active(id, transport.clone()).unwrap();
        assert!(matches!(fx.router.on_bytes_received(id, b"a"), RouteStatus::Pending));
        assert!(fx.router.on_read_error(id, io_error()));

        assert_eq!(fx.exceptions(), vec!["transport"]);
        assert_eq!(fx.builds(), 0);
        assert_eq!(fx.router.pending_count(), 0);
        assert_eq!(transport.closes(), 1);
    }

    #[test]
    fn failure_before_activation_is_a_no_op() {
        let fx = fixture(Setup::default());
        let id = ConnectionId::new();

        assert!(!fx.router.on_read_error(id, io_error()));
        assert!(!fx.router.on_read_eof(id));
        assert!(matches!(fx.router.on_bytes_received(id, b"a"), RouteStatus::NotPending));

        assert_eq!(fx.parser.created.load(Ordering::SeqCst), 0);
        assert_eq!(fx.parser.transport_active.load(Ordering::SeqCst), 0);
        assert_eq!(fx.parser.parses.load(Ordering::SeqCst), 0);
        assert_eq!(fx.builds(), 0);
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[test]
    fn external_error_after_routing_is_absorbed() {
        let fx = fixture(Setup::default());
        let id = ConnectionId::new();
        let transport = MockTransport::new();

        fx.router.on_connection_active(id, transport.clone()).unwrap();
        assert!(matches!(fx.router.on_bytes_received(id, b"a"), RouteStatus::Routed(_)));

        assert!(!fx.router.on_external_error(id, RoutingError::External("late".into())));
        assert!(!fx.router.report_error(id, RoutingError::External("later".into())));

        assert_eq!(fx.builds(), 1);
        assert_eq!(transport.closes(), 0);
        assert!(transport.posted.lock().unwrap().is_empty());
        assert!(fx.exceptions().is_empty());
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[test]
    fn routing_data_after_socket_error_is_ignored() {
        let fx = fixture(Setup::default());
        let id = ConnectionId::new();
        let transport = MockTransport::new();
        fx.router.on_connection_active(id, transport.clone()).unwrap();

        assert!(fx.router.on_read_error(id, io_error()));
        assert!(matches!(fx.router.on_routing_data(id, 'A'), RouteStatus::NotPending));

        assert_eq!(fx.builds(), 0);
        assert_eq!(transport.closes(), 1);
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[test]
    fn replays_every_buffered_byte_in_order() {
        let fx = fixture(Setup {
            ready_after: Some(5),
            ..Setup::default()
        });
        let id = ConnectionId::new();
        fx.router.on_connection_active(id, MockTransport::new()).unwrap();

        assert!(matches!(fx.router.on_bytes_received(id, b"ab"), RouteStatus::Pending));
        assert!(matches!(fx.router.on_bytes_received(id, b"cd"), RouteStatus::Pending));
        assert!(matches!(fx.router.on_bytes_received(id, b"efg"), RouteStatus::Routed(_)));

        assert_eq!(fx.events(), vec!["active", "read:abcdefg"]);
        assert_eq!(fx.parser.parses.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn consumed_routing_header_is_not_replayed() {
        let fx = fixture(Setup {
            ready_after: Some(3),
            consume: 2,
            ..Setup::default()
        });
        let id = ConnectionId::new();
        fx.router.on_connection_active(id, MockTransport::new()).unwrap();

        assert!(matches!(fx.router.on_bytes_received(id, b"A:payload"), RouteStatus::Routed(_)));
        assert_eq!(fx.events(), vec!["active", "read:payload"]);
    }

    #[test]
    fn construction_failure_closes_without_reinserting() {
        let fx = fixture(Setup {
            factory_fails: true,
            ..Setup::default()
        });
        let id = ConnectionId::new();
        let transport = MockTransport::new();
        fx.router.on_connection_active(id, transport.clone()).unwrap();

        assert!(matches!(fx.router.on_bytes_received(id, b"a"), RouteStatus::Closed));
        assert_eq!(fx.builds(), 1);
        assert_eq!(transport.closes(), 1);
        assert!(!fx.router.is_pending(id));

        assert!(!fx.router.on_external_error(id, RoutingError::External("late".into())));
        assert_eq!(transport.closes(), 1);
    }

    #[test]
    fn parse_failure_tears_down() {
        let fx = fixture(Setup {
            ready_after: None,
            reject: Some(b'!'),
            ..Setup::default()
        });
        let id = ConnectionId::new();
        let transport = MockTransport::new();
        fx.router.on_connection_active(id, transport.clone()).unwrap();

        assert!(matches!(fx.router.on_bytes_received(id, b"ok"), RouteStatus::Pending));
        assert!(matches!(fx.router.on_bytes_received(id, b"bad!"), RouteStatus::Closed));
        assert_eq!(fx.exceptions(), vec!["parse"]);
        assert_eq!(transport.closes(), 1);
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[test]
    fn pending_buffer_limit_is_enforced() {
        let fx = fixture(Setup {
            ready_after: None,
            options: RouterOptions {
                max_pending_bytes: 4,
                log_stale_reports: false,
            },
            ..Setup::default()
        });
        let id = ConnectionId::new();
        fx.router.on_connection_active(id, MockTransport::new()).unwrap();

        assert!(matches!(fx.router.on_bytes_received(id, b"abcd"), RouteStatus::Pending));
        assert!(matches!(fx.router.on_bytes_received(id, b"e"), RouteStatus::Closed));
        assert_eq!(fx.exceptions(), vec!["buffer_limit"]);
        assert_eq!(fx.builds(), 0);
    }

    #[test]
    fn eof_while_pending_notifies_parser() {
        let fx = fixture(Setup {
            ready_after: None,
            ..Setup::default()
        });
        let id = ConnectionId::new();
        let transport = MockTransport::new();
        fx.router.on_connection_active(id, transport.clone()).unwrap();

        assert!(fx.router.on_read_eof(id));
        assert!(!fx.router.on_read_eof(id));
        assert_eq!(fx.exceptions(), vec!["eof"]);
        assert_eq!(transport.closes(), 1);
    }

    #[test]
    fn duplicate_activation_is_rejected() {
        let fx = fixture(Setup::default());
        let id = ConnectionId::new();
        fx.router.on_connection_active(id, MockTransport::new()).unwrap();

        let err = fx.router.on_connection_active(id, MockTransport::new()).unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateConnection(_)));
        assert_eq!(fx.router.pending_count(), 1);
        assert_eq!(fx.parser.transport_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn report_error_posts_to_owning_task() {
        let fx = fixture(Setup {
            ready_after: None,
            ..Setup::default()
        });
        let id = ConnectionId::new();
        let transport = MockTransport::new();
        fx.router.on_connection_active(id, transport.clone()).unwrap();

        assert!(fx.router.report_error(id, RoutingError::External("supervisor".into())));
        assert_eq!(*transport.posted.lock().unwrap(), vec!["external".to_string()]);
        // Teardown happens when the owning task processes the message.
        assert!(fx.router.is_pending(id));

        assert!(fx.router.on_external_error(id, RoutingError::External("supervisor".into())));
        assert_eq!(fx.router.pending_count(), 0);
        assert_eq!(transport.closes(), 1);
    }

    #[test]
    fn report_error_tears_down_when_task_is_gone() {
        let fx = fixture(Setup {
            ready_after: None,
            ..Setup::default()
        });
        let id = ConnectionId::new();
        let transport = MockTransport::with_posts(false);
        fx.router.on_connection_active(id, transport.clone()).unwrap();

        assert!(fx.router.report_error(id, RoutingError::Shutdown));
        assert_eq!(fx.router.pending_count(), 0);
        assert_eq!(fx.exceptions(), vec!["shutdown"]);
        assert_eq!(transport.closes(), 1);
    }

    #[test]
    fn racing_teardowns_run_exactly_once() {
        for _ in 0..100 {
            let fx = fixture(Setup {
                ready_after: None,
                ..Setup::default()
            });
            let id = ConnectionId::new();
            let transport = MockTransport::new();
            fx.router.on_connection_active(id, transport.clone()).unwrap();

            let barrier = Barrier::new(2);
            let (eof, external) = std::thread::scope(|scope| {
                let external = scope.spawn(|| {
                    barrier.wait();
                    fx.router
                        .on_external_error(id, RoutingError::External("supervisor".into()))
                });
                barrier.wait();
                let eof = fx.router.on_read_eof(id);
                (eof, external.join().unwrap())
            });

            assert!(eof ^ external, "exactly one teardown must win");
            assert_eq!(fx.exceptions().len(), 1);
            assert_eq!(transport.closes(), 1);
            assert_eq!(fx.router.pending_count(), 0);
        }
    }

    #[test]
    fn racing_success_and_external_error_resolve_once() {
        for _ in 0..100 {
            let fx = fixture(Setup::default());
            let id = ConnectionId::new();
            let transport = MockTransport::new();
            fx.router.on_connection_active(id, transport.clone()).unwrap();

            let barrier = Barrier::new(2);
            let (routed, torn_down) = std::thread::scope(|scope| {
                let external = scope.spawn(|| {
                    barrier.wait();
                    fx.router
                        .on_external_error(id, RoutingError::External("supervisor".into()))
                });
                barrier.wait();
                let routed = matches!(fx.router.on_bytes_received(id, b"a"), RouteStatus::Routed(_));
                (routed, external.join().unwrap())
            });

            assert!(routed ^ torn_down, "exactly one path must resolve the connection");
            assert_eq!(fx.builds(), usize::from(routed));
            assert_eq!(transport.closes(), usize::from(torn_down));
            assert_eq!(fx.router.pending_count(), 0);
        }
    }

    struct PendingGaugeRecorder {
        pending: Arc<std::sync::atomic::AtomicU64>,
    }

    impl ::metrics::Recorder for PendingGaugeRecorder {
        fn describe_counter(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_gauge(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_histogram(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn register_counter(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            ::metrics::Counter::noop()
        }

        fn register_gauge(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            if key.name() == "router_pending_connections" {
                ::metrics::Gauge::from_arc(Arc::clone(&self.pending))
            } else {
                ::metrics::Gauge::noop()
            }
        }

        fn register_histogram(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn pending_gauge_matches_registry_under_concurrency() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;

        let recorder = PendingGaugeRecorder {
            pending: Arc::new(std::sync::atomic::AtomicU64::new(0f64.to_bits())),
        };
        let fx = fixture(Setup::default());
        let barrier = Barrier::new(THREADS);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    ::metrics::with_local_recorder(&recorder, || {
                        barrier.wait();
                        for n in 0..PER_THREAD {
                            let id = ConnectionId::new();
                            fx.router.on_connection_active(id, MockTransport::new()).unwrap();
                            match n % 3 {
                                0 => {
                                    fx.router.on_bytes_received(id, b"a");
                                }
                                1 => {
                                    fx.router.on_read_eof(id);
                                    fx.router.on_read_eof(id);
                                }
                                _ => {}
                            }
                        }
                    })
                });
            }
        });

        // n % 3 == 2 stays pending: 16 per thread.
        assert_eq!(fx.router.pending_count(), THREADS * 16);
        let gauge = f64::from_bits(recorder.pending.load(Ordering::SeqCst));
        assert_eq!(gauge, fx.router.pending_count() as f64);
    }

    struct SlowParser {
        entered: std::sync::mpsc::Sender<()>,
    }

    impl crate::routing::parser::RoutingDataParser<char> for SlowParser {
        fn parse_routing_data(&mut self, _buf: &mut BytesMut) -> Result<ParseOutcome<char>, RoutingError> {
            let _ = self.entered.send(());
            std::thread::sleep(std::time::Duration::from_millis(30));
            Ok(ParseOutcome::NeedMoreData)
        }
    }

    #[test]
    fn external_error_during_parse_waits_for_it() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let router: AcceptRouter<char> = AcceptRouter::new(
            move |_ctx: &ConnectionContext| -> Box<dyn crate::routing::parser::RoutingDataParser<char>> {
                Box::new(SlowParser {
                    entered: entered_tx.clone(),
                })
            },
            |_key: &char, _transport: &TransportRef| -> Result<DownstreamChain, RoutingError> {
                Err(RoutingError::Construction("unused".into()))
            },
            RouterOptions::default(),
        );
        let id = ConnectionId::new();
        let transport = MockTransport::new();
        router.on_connection_active(id, transport.clone()).unwrap();

        let router_ref = &router;
        let (status, torn_down) = std::thread::scope(|scope| {
            let external = scope.spawn(move || {
                entered_rx.recv().unwrap();
                router_ref.on_external_error(id, RoutingError::External("supervisor".into()))
            });
            let status = router_ref.on_bytes_received(id, b"a");
            (status, external.join().unwrap())
        });

        // The parse finished first; the teardown then ran exactly once.
        assert!(matches!(status, RouteStatus::Pending));
        assert!(torn_down);
        assert_eq!(transport.closes(), 1);
        assert_eq!(router.pending_count(), 0);
    }
}
