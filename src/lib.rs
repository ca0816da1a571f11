//! Userspace TCP/IP stack bridge library.
//!
//! Exposes a packet-switched network engine to a single-threaded host:
//! background engine work is funneled through a deferred task queue, host
//! objects carry only opaque handles, and stream sockets are driven by a
//! channel-based state machine.

pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod host;
pub mod link;
pub mod net;
pub mod observability;
pub mod stack;

pub use config::schema::BridgeConfig;
pub use error::{BridgeError, Result};
pub use host::{Completion, Event, Host, HostLoop, HostObject};
pub use net::{ConnectOptions, ListenOptions, Server, Socket};
pub use stack::{Interface, InterfaceOptions, Stack, StackOptions};
