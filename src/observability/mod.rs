//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges via the metrics facade)
//!
//! Consumers:
//!     → whatever subscriber / recorder the embedding binary installs
//! ```
//!
//! # Design Decisions
//! - Structured key-value fields (stack_id, socket_id, server_id, peer)
//! - The library installs no exporter
//! - Metrics are cheap (atomic increments) and can be switched off

pub mod logging;
pub mod metrics;
