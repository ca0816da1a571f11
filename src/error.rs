//! Bridge error taxonomy.
//!
//! # Categories
//! - Configuration: missing or invalid options, returned synchronously
//! - Engine: dial/bind/accept/read/write failures, delivered asynchronously
//!   as an `error` event or as a callback argument
//! - Protocol boundary: frames or packets the bridge cannot classify,
//!   returned synchronously to the injecting call

use thiserror::Error;

use crate::engine::EngineError;
use crate::handle::{Handle, HandlesExhausted};

/// Errors surfaced by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A required option was not supplied.
    #[error("{0} not set")]
    MissingOption(&'static str),

    /// An option was supplied but could not be used.
    #[error("invalid {field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    /// A host string did not parse as an IP address.
    #[error("invalid address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// A network string did not parse as an address prefix.
    #[error("invalid network: {0}")]
    PrefixParse(#[from] ipnet::AddrParseError),

    #[error("unknown stack {0}")]
    UnknownStack(Handle),

    #[error("unknown socket {0}")]
    UnknownSocket(Handle),

    #[error("unknown server {0}")]
    UnknownServer(Handle),

    #[error("unknown interface {0}")]
    UnknownInterface(Handle),

    /// The 32-bit handle space of a table is used up.
    #[error("handle space exhausted")]
    HandlesExhausted,

    /// Opaque failure reported by the network engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Frame or packet rejected at the injection boundary.
    #[error("{0}")]
    Protocol(String),

    /// The socket closed before a connection was established.
    #[error("socket is not connected")]
    NotConnected,

    /// `connect` may be called once per socket.
    #[error("socket has already been connected")]
    AlreadyConnected,

    #[error("Server is not running.")]
    NotListening,

    #[error("server is already listening")]
    AlreadyListening,
}

impl From<HandlesExhausted> for BridgeError {
    fn from(_: HandlesExhausted) -> Self {
        BridgeError::HandlesExhausted
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
