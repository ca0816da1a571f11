//! Network engine collaborator contract.
//!
//! # Data Flow
//! ```text
//! StackContext
//!     → NetworkEngine::create_stack (one engine stack per bridge stack)
//!     → EngineStack::create_nic / add_protocol_address / routes
//!     → EngineStack::dial_tcp    → TransportConn (read / write / close)
//!     → EngineStack::listen_tcp  → TcpAcceptor (accept / close)
//! ```
//!
//! # Design Decisions
//! - Stream calls (dial, listen, accept, read, write, close) may block and
//!   only run on the blocking pool
//! - NIC, address and route configuration returns promptly and runs inline
//! - Engine failures are opaque strings (`EngineError`)
//! - `memory.rs` is an in-process engine that honours this contract

pub mod memory;
pub mod pipe;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use ipnet::IpNet;
use thiserror::Error;

use crate::link::endpoint::ChannelEndpoint;

/// Opaque failure reported by the network engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// NIC identifier within one engine stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NicId(pub u32);

impl fmt::Display for NicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nic-{}", self.0)
    }
}

/// Route table entry: traffic for `destination` leaves through `nic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub nic: NicId,
}

/// Link layer attached to a NIC.
#[derive(Debug, Clone)]
pub enum LinkKind {
    /// Traffic never leaves the engine.
    Loopback,
    /// Ethernet frames exchanged through a channel endpoint.
    Ethernet(Arc<ChannelEndpoint>),
    /// Raw IP packets exchanged through a channel endpoint.
    Ip(Arc<ChannelEndpoint>),
}

/// Factory for engine stacks.
pub trait NetworkEngine: fmt::Debug + Send + Sync + 'static {
    fn create_stack(&self) -> Result<Arc<dyn EngineStack>, EngineError>;
}

/// One engine stack instance.
pub trait EngineStack: fmt::Debug + Send + Sync {
    fn create_nic(&self, nic: NicId, link: LinkKind) -> Result<(), EngineError>;

    fn add_protocol_address(&self, nic: NicId, address: IpNet) -> Result<(), EngineError>;

    /// Replace the whole route table.
    fn set_route_table(&self, routes: Vec<Route>);

    fn add_route(&self, route: Route);

    fn set_nic_forwarding(&self, nic: NicId, enabled: bool) -> Result<(), EngineError>;

    /// Blocking TCP dial.
    fn dial_tcp(&self, remote: SocketAddr) -> Result<Arc<dyn TransportConn>, EngineError>;

    /// Bind and listen. Port 0 picks an ephemeral port.
    fn listen_tcp(&self, local: SocketAddr) -> Result<Arc<dyn TcpAcceptor>, EngineError>;
}

/// Established stream connection.
///
/// Methods take `&self` because a read and a write may be in flight at the
/// same time on different threads.
pub trait TransportConn: fmt::Debug + Send + Sync {
    /// Blocking read. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Blocking write; may accept fewer bytes than offered.
    fn write(&self, buf: &[u8]) -> Result<usize, EngineError>;

    fn close(&self) -> Result<(), EngineError>;

    fn local_address(&self) -> Result<SocketAddr, EngineError>;

    fn remote_address(&self) -> Result<SocketAddr, EngineError>;

    fn set_no_delay(&self, enabled: bool);
}

/// Listening endpoint.
pub trait TcpAcceptor: fmt::Debug + Send + Sync {
    /// Blocking accept. Fails once the acceptor is closed.
    fn accept(&self) -> Result<Arc<dyn TransportConn>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;

    fn local_address(&self) -> Result<SocketAddr, EngineError>;
}

/// Write the whole buffer, looping over short writes.
pub fn write_all(conn: &dyn TransportConn, mut buf: &[u8]) -> Result<usize, EngineError> {
    let total = buf.len();
    while !buf.is_empty() {
        let written = conn.write(buf)?;
        if written == 0 {
            return Err(EngineError::new("connection accepted no bytes"));
        }
        buf = &buf[written..];
    }
    Ok(total)
}
