//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Root configuration for the bridge.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// Link endpoint and pump settings.
    pub link: LinkConfig,

    /// Stream socket defaults.
    pub socket: SocketConfig,

    /// In-process engine settings.
    pub engine: EngineConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Link endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfig {
    /// MTU reported by channel endpoints.
    pub mtu: u32,

    /// Outbound units an endpoint holds before rejecting writes.
    pub queue_depth: usize,

    /// Capacity of the hand-off channel between pump and forwarding task.
    pub pump_depth: usize,

    /// MAC address of a stack's own NIC when none is given.
    pub stack_mac_address: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            queue_depth: 1024,
            pump_depth: 1,
            stack_mac_address: "0a:0a:0b:0b:0c:0c".to_string(),
        }
    }
}

/// Stream socket defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Host used by `connect` when none is given.
    pub default_host: String,

    /// Suggested read size for hosts that don't pick one.
    pub read_chunk: usize,

    /// No-delay applied to new connections unless overridden.
    pub no_delay: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            default_host: "127.0.0.1".to_string(),
            read_chunk: 16 * 1024,
            no_delay: false,
        }
    }
}

/// In-process engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First port handed out for dials and port-0 binds.
    pub ephemeral_port_start: u16,

    /// Last ephemeral port (inclusive).
    pub ephemeral_port_end: u16,

    /// Pending connections a listener queues before dials block.
    pub accept_backlog: usize,

    /// Echo every unit injected into a channel NIC back out of it.
    pub reflect_inbound: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ephemeral_port_start: 49152,
            ephemeral_port_end: 65535,
            accept_backlog: 128,
            reflect_inbound: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Record metrics through the `metrics` facade.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
