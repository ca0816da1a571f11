//! Per-stack native state.
//!
//! # Responsibilities
//! - Own the engine stack and its primary Ethernet NIC
//! - Own the handle tables for sockets, servers and interfaces
//! - Start the pump surfacing the stack's outbound frames

use std::net::SocketAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::BridgeConfig;
use crate::engine::{EngineStack, LinkKind, NetworkEngine, NicId, Route};
use crate::error::{BridgeError, Result};
use crate::handle::{Handle, HandleTable};
use crate::host::{DeferredInvoker, Event, HostObject};
use crate::link::{ChannelEndpoint, MacAddress, PacketPump, PumpTarget};
use crate::net::connection::Connection;
use crate::net::listener::ListenSession;
use crate::stack::interface::InterfaceBinding;

/// NIC carrying the stack's own address.
pub const STACK_NIC: NicId = NicId(1);

#[derive(Debug)]
pub struct StackContext {
    id: Handle,
    network: IpNet,
    engine: Arc<dyn EngineStack>,
    endpoint: Arc<ChannelEndpoint>,
    _pump: Arc<PacketPump>,
    sockets: HandleTable<Arc<Connection>>,
    servers: HandleTable<Arc<ListenSession>>,
    interfaces: HandleTable<Arc<InterfaceBinding>>,
    config: Arc<BridgeConfig>,
}

impl StackContext {
    /// Create the engine stack, its Ethernet NIC and default routes.
    pub(crate) fn build(
        id: Handle,
        engine: &dyn NetworkEngine,
        network: IpNet,
        mac_address: MacAddress,
        config: Arc<BridgeConfig>,
        invoker: DeferredInvoker,
    ) -> Result<Self> {
        let stack = engine.create_stack()?;
        let endpoint = Arc::new(ChannelEndpoint::new(
            config.link.queue_depth,
            config.link.mtu,
            Some(mac_address),
        ));
        stack.create_nic(STACK_NIC, LinkKind::Ethernet(Arc::clone(&endpoint)))?;
        stack.add_protocol_address(STACK_NIC, network)?;
        stack.set_route_table(vec![
            Route {
                destination: IpNet::V4(Ipv4Net::default()),
                nic: STACK_NIC,
            },
            Route {
                destination: IpNet::V6(Ipv6Net::default()),
                nic: STACK_NIC,
            },
        ]);

        let pump = PacketPump::start(
            Arc::clone(&endpoint),
            config.link.pump_depth,
            invoker,
            PumpTarget {
                object: HostObject::Stack(id),
                make_event: Event::OutboundEthernetFrame,
                direction: "stack",
            },
        );

        Ok(Self {
            id,
            network,
            engine: stack,
            endpoint,
            _pump: pump,
            sockets: HandleTable::new(),
            servers: HandleTable::new(),
            interfaces: HandleTable::new(),
            config,
        })
    }

    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn network(&self) -> IpNet {
        self.network
    }

    pub fn engine(&self) -> &Arc<dyn EngineStack> {
        &self.engine
    }

    pub fn endpoint(&self) -> &Arc<ChannelEndpoint> {
        &self.endpoint
    }

    pub fn config(&self) -> &Arc<BridgeConfig> {
        &self.config
    }

    pub fn sockets(&self) -> &HandleTable<Arc<Connection>> {
        &self.sockets
    }

    pub fn servers(&self) -> &HandleTable<Arc<ListenSession>> {
        &self.servers
    }

    pub fn interfaces(&self) -> &HandleTable<Arc<InterfaceBinding>> {
        &self.interfaces
    }

    pub fn socket(&self, id: Handle) -> Result<Arc<Connection>> {
        self.sockets.get(id).ok_or(BridgeError::UnknownSocket(id))
    }

    pub fn server(&self, id: Handle) -> Result<Arc<ListenSession>> {
        self.servers.get(id).ok_or(BridgeError::UnknownServer(id))
    }

    pub fn interface(&self, id: Handle) -> Result<Arc<InterfaceBinding>> {
        self.interfaces.get(id).ok_or(BridgeError::UnknownInterface(id))
    }

    /// Register a connection as a new socket of this stack.
    ///
    /// Both locally created and accepted sockets come through here.
    pub fn install_socket(&self, connection: Arc<Connection>) -> Result<Handle> {
        Ok(self.sockets.insert(connection)?)
    }

    /// Resolve a host string plus port, rewriting `localhost`.
    pub(crate) fn socket_address(host: &str, port: u16) -> Result<SocketAddr> {
        let host = if host == "localhost" { "127.0.0.1" } else { host };
        Ok(SocketAddr::new(host.parse()?, port))
    }
}
