//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Router and connection tasks produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging with connection IDs as fields
//! - Metrics are cheap (no-ops until an exporter is installed)

pub mod logging;
pub mod metrics;
