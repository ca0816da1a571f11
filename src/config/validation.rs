//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (MTU, depths, port range)
//! - Validate address literals (MAC, default host)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BridgeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::IpAddr;

use crate::config::schema::BridgeConfig;
use crate::link::MacAddress;

/// Smallest MTU an IPv4 host must accept.
const MIN_MTU: u32 = 68;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// One rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every semantic constraint and collect the violations.
pub fn validate_config(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.link.mtu < MIN_MTU {
        errors.push(ValidationError::new(
            "link.mtu",
            format!("must be at least {MIN_MTU}, got {}", config.link.mtu),
        ));
    }
    if config.link.queue_depth == 0 {
        errors.push(ValidationError::new("link.queue_depth", "must be greater than 0"));
    }
    if config.link.pump_depth == 0 {
        errors.push(ValidationError::new("link.pump_depth", "must be greater than 0"));
    }
    if config.link.stack_mac_address.parse::<MacAddress>().is_err() {
        errors.push(ValidationError::new(
            "link.stack_mac_address",
            format!("{:?} is not a MAC address", config.link.stack_mac_address),
        ));
    }

    let default_host = config.socket.default_host.as_str();
    if default_host != "localhost" && default_host.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "socket.default_host",
            format!("{default_host:?} is not an IP address"),
        ));
    }
    if config.socket.read_chunk == 0 {
        errors.push(ValidationError::new("socket.read_chunk", "must be greater than 0"));
    }

    if config.engine.ephemeral_port_start == 0
        || config.engine.ephemeral_port_start > config.engine.ephemeral_port_end
    {
        errors.push(ValidationError::new(
            "engine.ephemeral_port_start",
            format!(
                "range {}-{} is empty or starts at 0",
                config.engine.ephemeral_port_start, config.engine.ephemeral_port_end
            ),
        ));
    }
    if config.engine.accept_backlog == 0 {
        errors.push(ValidationError::new("engine.accept_backlog", "must be greater than 0"));
    }

    if !LOG_LEVELS.contains(&config.observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level {:?}", config.observability.log_level),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&BridgeConfig::default()), Ok(()));
    }

    #[test]
    fn every_violation_is_reported() {
        let mut config = BridgeConfig::default();
        config.link.mtu = 10;
        config.link.pump_depth = 0;
        config.link.stack_mac_address = "nope".to_string();
        config.socket.default_host = "example.com".to_string();
        config.engine.ephemeral_port_start = 60000;
        config.engine.ephemeral_port_end = 50000;
        config.observability.log_level = "loud".to_string();

        let fields: Vec<_> = validate_config(&config)
            .unwrap_err()
            .into_iter()
            .map(|error| error.field)
            .collect();
        assert_eq!(
            fields,
            vec![
                "link.mtu",
                "link.pump_depth",
                "link.stack_mac_address",
                "socket.default_host",
                "engine.ephemeral_port_start",
                "observability.log_level",
            ]
        );
    }

    #[test]
    fn localhost_is_an_accepted_default_host() {
        let mut config = BridgeConfig::default();
        config.socket.default_host = "localhost".to_string();
        assert!(validate_config(&config).is_ok());
    }
}
