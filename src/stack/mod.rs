//! Network stacks and their interfaces.
//!
//! # Data Flow
//! ```text
//! Stack::create(options)
//!     → StackRegistry (stack handle) → StackContext::build (engine stack, NIC 1)
//! Stack::create_interface(options)
//!     → StackContext interfaces table → InterfaceBinding::build (NIC handle+1)
//! Stack::create_socket / create_server
//!     → StackContext sockets / servers tables
//! ```
//!
//! # Design Decisions
//! - Option errors are returned before any engine call is made
//! - A builder that fails burns its handle; nothing half-built is stored
//! - Stacks are never torn down

pub mod context;
pub mod interface;
pub mod registry;

pub use context::StackContext;
pub use interface::{InterfaceBinding, InterfaceKind, InterfaceOptions};
pub use registry::StackRegistry;

use std::sync::Arc;

use bytes::Bytes;
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::host::{Host, HostObject};
use crate::link::frame::ethertype_of;
use crate::link::MacAddress;
use crate::net::connection::Connection;
use crate::net::listener::ListenSession;
use crate::net::server::Server;
use crate::net::socket::Socket;

/// Stack construction options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StackOptions {
    /// Address and prefix of the stack's own NIC, e.g. `10.0.0.1/24`.
    pub ip_network: Option<String>,
    /// Falls back to `link.stack_mac_address`.
    pub mac_address: Option<String>,
}

impl StackOptions {
    pub fn new(ip_network: impl Into<String>) -> Self {
        Self {
            ip_network: Some(ip_network.into()),
            mac_address: None,
        }
    }

    pub fn mac_address(mut self, mac_address: impl Into<String>) -> Self {
        self.mac_address = Some(mac_address.into());
        self
    }
}

/// Host-visible network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stack {
    id: Handle,
}

impl From<Stack> for HostObject {
    fn from(stack: Stack) -> Self {
        HostObject::Stack(stack.id)
    }
}

impl Stack {
    pub fn create(host: &mut Host, options: StackOptions) -> Result<Stack> {
        let network: IpNet = options
            .ip_network
            .as_deref()
            .ok_or(BridgeError::MissingOption("ip_network"))?
            .parse()?;
        let mac_address: MacAddress = options
            .mac_address
            .as_deref()
            .unwrap_or(&host.config().link.stack_mac_address)
            .parse()?;

        let engine = Arc::clone(host.engine());
        let config = Arc::clone(host.config());
        let invoker = host.invoker();
        let id = host.stacks().register_with(|id| {
            StackContext::build(id, engine.as_ref(), network, mac_address, config, invoker).map(Arc::new)
        })?;

        tracing::info!(stack_id = %id, network = %network, mac = %mac_address, "Stack created");
        Ok(Stack { id })
    }

    pub const fn from_handle(id: Handle) -> Self {
        Self { id }
    }

    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn context(&self, host: &Host) -> Result<Arc<StackContext>> {
        host.stacks().get(self.id)
    }

    pub fn create_socket(&self, host: &mut Host) -> Result<Socket> {
        let context = self.context(host)?;
        let id = context.install_socket(Arc::new(Connection::new()))?;
        tracing::debug!(stack_id = %self.id, socket_id = %id, "Socket created");
        Ok(Socket::from_parts(self.id, id))
    }

    pub fn create_server(&self, host: &mut Host) -> Result<Server> {
        let context = self.context(host)?;
        let id = context.servers().insert(Arc::new(ListenSession::new()))?;
        tracing::debug!(stack_id = %self.id, server_id = %id, "Server created");
        Ok(Server::from_parts(self.id, id))
    }

    pub fn create_interface(&self, host: &mut Host, options: InterfaceOptions) -> Result<Interface> {
        let context = self.context(host)?;
        let invoker = host.invoker();
        let id = context
            .interfaces()
            .try_insert_with(|id| InterfaceBinding::build(&context, id, &options, invoker).map(Arc::new))?;

        let binding = context.interface(id)?;
        tracing::info!(
            stack_id = %self.id,
            interface_id = %id,
            nic_id = binding.nic().0,
            kind = ?binding.kind(),
            "Interface created"
        );
        Ok(Interface { stack: self.id, id })
    }

    /// Feed an Ethernet frame into the stack's own NIC.
    pub fn inject_ethernet_frame(&self, host: &Host, frame: Bytes) -> Result<()> {
        let context = self.context(host)?;
        let protocol = ethertype_of(&frame)?;
        Ok(context.endpoint().inject_inbound(protocol, frame)?)
    }

    pub fn mac_address(&self, host: &Host) -> Result<Option<MacAddress>> {
        Ok(self.context(host)?.endpoint().link_address())
    }
}

/// Host-visible interface of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interface {
    stack: Handle,
    id: Handle,
}

impl From<Interface> for HostObject {
    fn from(interface: Interface) -> Self {
        HostObject::Interface {
            stack: interface.stack,
            interface: interface.id,
        }
    }
}

impl Interface {
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn stack(&self) -> Stack {
        Stack::from_handle(self.stack)
    }

    fn binding(&self, host: &Host) -> Result<Arc<InterfaceBinding>> {
        host.stacks().get(self.stack)?.interface(self.id)
    }

    pub fn kind(&self, host: &Host) -> Result<InterfaceKind> {
        Ok(self.binding(host)?.kind())
    }

    /// Feed an inbound frame (tap) or IP packet (tun) into the engine.
    pub fn inject(&self, host: &Host, unit: Bytes) -> Result<()> {
        self.binding(host)?.inject(unit)
    }
}
