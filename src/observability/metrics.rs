//! Metrics collection.
//!
//! # Metrics
//! - `tcpip_bridge_frames_forwarded_total` (counter): units pumped to the host, by direction
//! - `tcpip_bridge_frames_dropped_total` (counter): units rejected by a full endpoint queue
//! - `tcpip_bridge_connections_accepted_total` (counter)
//! - `tcpip_bridge_dial_failures_total` (counter)
//! - `tcpip_bridge_idle_timeouts_total` (counter)
//! - `tcpip_bridge_server_connections` (gauge): live accepted sockets across servers
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; without a recorder every call is a no-op
//! - A global switch mirrors `observability.metrics_enabled`

use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn record_frame_forwarded(direction: &'static str) {
    if enabled() {
        metrics::counter!("tcpip_bridge_frames_forwarded_total", "direction" => direction).increment(1);
    }
}

pub fn record_frame_dropped() {
    if enabled() {
        metrics::counter!("tcpip_bridge_frames_dropped_total").increment(1);
    }
}

pub fn record_connection_accepted() {
    if enabled() {
        metrics::counter!("tcpip_bridge_connections_accepted_total").increment(1);
        metrics::gauge!("tcpip_bridge_server_connections").increment(1.0);
    }
}

pub fn record_server_connection_closed() {
    if enabled() {
        metrics::gauge!("tcpip_bridge_server_connections").decrement(1.0);
    }
}

pub fn record_dial_failure() {
    if enabled() {
        metrics::counter!("tcpip_bridge_dial_failures_total").increment(1);
    }
}

pub fn record_idle_timeout() {
    if enabled() {
        metrics::counter!("tcpip_bridge_idle_timeouts_total").increment(1);
    }
}
