//! Link layer plumbing between engine NICs and the host.
//!
//! # Data Flow
//! ```text
//! Outbound: engine NIC → ChannelEndpoint queue → PacketPump → host event
//! Inbound:  host inject → frame classification → ChannelEndpoint::inject_inbound → engine
//! ```

pub mod endpoint;
pub mod frame;
pub mod pump;

pub use endpoint::{ChannelEndpoint, NetworkDispatcher, WriteNotify};
pub use frame::{MacAddress, NetworkProtocol};
pub use pump::{PacketPump, PumpTarget};
