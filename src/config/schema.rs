//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files.

use serde::{Deserialize, Serialize};

/// Root configuration for the accept router.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Behaviour while a connection is pending routing.
    pub routing: RoutingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Routes selectable by the prefix sniffer.
    pub routes: Vec<RouteConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            routing: RoutingConfig::default(),
            observability: ObservabilityConfig::default(),
            routes: vec![
                RouteConfig {
                    name: "echo".to_string(),
                    prefix: "ECHO".to_string(),
                    handler: HandlerConfig::Echo,
                },
                RouteConfig {
                    name: "hello".to_string(),
                    prefix: "HELLO".to_string(),
                    handler: HandlerConfig::Banner {
                        message: "hello from accept-router\n".to_string(),
                    },
                },
            ],
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7000").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Size of each socket read.
    pub read_buffer_size: usize,

    /// How long shutdown waits for connections to finish.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7000".to_string(),
            max_connections: 10_000,
            read_buffer_size: 4096,
            drain_timeout_secs: 10,
        }
    }
}

/// Pending-state policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Bytes that may be buffered before a routing decision. 0 = unlimited.
    pub max_pending_bytes: usize,

    /// Deadline for a routing decision in milliseconds. 0 disables it.
    pub routing_timeout_ms: u64,

    /// Log error reports that arrive after a connection resolved.
    pub log_stale_reports: bool,

    /// Route used when no prefix can match.
    pub default_route: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: 64 * 1024,
            routing_timeout_ms: 5_000,
            log_stale_reports: false,
            default_route: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A route: connections whose first bytes start with `prefix` go to `handler`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// Route identifier, also the routing key.
    pub name: String,

    /// Leading bytes that select this route.
    pub prefix: String,

    /// Downstream handler to attach.
    pub handler: HandlerConfig,
}

/// Built-in downstream handlers.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Write every read back.
    Echo,
    /// Send `message` and close.
    Banner { message: String },
    /// Swallow input.
    Discard,
}
