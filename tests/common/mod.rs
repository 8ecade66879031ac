//! Shared utilities for integration tests.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use accept_router::config::{HandlerConfig, RouteConfig, RouterConfig};
use accept_router::net::{ConnectionTracker, Listener};
use accept_router::{AcceptRouter, RouterServer};

/// A router server running on an ephemeral loopback port.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub router: AcceptRouter<String>,
    pub tracker: ConnectionTracker,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestServer {
    /// Trigger shutdown and wait for the drain to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

/// Config with echo, banner, and discard routes.
pub fn test_config() -> RouterConfig {
    let mut config = RouterConfig::default();
    config.listener.drain_timeout_secs = 2;
    config.routing.routing_timeout_ms = 0;
    config.routes = vec![
        RouteConfig {
            name: "echo".into(),
            prefix: "ECHO".into(),
            handler: HandlerConfig::Echo,
        },
        RouteConfig {
            name: "hello".into(),
            prefix: "HELLO".into(),
            handler: HandlerConfig::Banner {
                message: "hi\n".into(),
            },
        },
        RouteConfig {
            name: "sink".into(),
            prefix: "SINK".into(),
            handler: HandlerConfig::Discard,
        },
    ];
    config
}

pub async fn start_server(config: RouterConfig) -> TestServer {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections);
    let addr = listener.local_addr().unwrap();

    let server = RouterServer::new(&config);
    let router = server.router();
    let tracker = server.tracker();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        server
            .run(listener, async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        router,
        tracker,
        stop: Some(stop_tx),
        handle,
    }
}

/// Poll `check` until it returns true or two seconds pass.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
