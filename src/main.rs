//! accept-router binary.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!   client ──────▶│ listener → AcceptRouter (sniff first bytes)  │
//!                 │              │                               │
//!                 │              ▼                               │
//!                 │   route table → echo / banner / discard      │
//!                 └──────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use accept_router::config::validation::validate_config;
use accept_router::config::watcher::{apply_route_updates, ConfigWatcher};
use accept_router::config::{load_config, ConfigError, RouterConfig};
use accept_router::lifecycle::wait_for_signal;
use accept_router::net::Listener;
use accept_router::observability::{logging, metrics};
use accept_router::RouterServer;

#[derive(Parser)]
#[command(name = "accept-router")]
#[command(about = "Routes TCP connections by their first bytes", long_about = None)]
struct Cli {
    /// TOML configuration file; watched for route changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn resolve_config(cli: &Cli) -> Result<RouterConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RouterConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.listener.bind_address = bind.clone();
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    if cli.check {
        println!("configuration OK ({} routes)", config.routes.len());
        return Ok(());
    }

    logging::init_logging(&config.observability)?;
    tracing::info!("accept-router v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        routes = config.routes.len(),
        routing_timeout_ms = config.routing.routing_timeout_ms,
        max_pending_bytes = config.routing.max_pending_bytes,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let server = RouterServer::new(&config);

    // Keep the watcher alive for the lifetime of the server.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            tokio::spawn(apply_route_updates(updates, server.route_table()));
            Some(watcher)
        }
        None => None,
    };

    let listener = Listener::bind(&config.listener).await?;
    server.run(listener, wait_for_signal()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
