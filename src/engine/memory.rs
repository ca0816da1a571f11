//! In-process network engine.
//!
//! # Responsibilities
//! - Keep per-stack NIC, address and route tables
//! - Deliver TCP dials to listeners bound in the same stack
//! - Count (and optionally reflect) traffic injected into channel NICs
//!
//! # Design Decisions
//! - Streams are pairs of blocking pipes, so every call really blocks
//! - Stacks never see each other's listeners
//! - No frames are parsed; reflection echoes inbound units unchanged

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use ipnet::IpNet;

use super::pipe::Pipe;
use super::{EngineError, EngineStack, LinkKind, NetworkEngine, NicId, Route, TcpAcceptor, TransportConn};
use crate::config::EngineConfig;
use crate::link::endpoint::{ChannelEndpoint, NetworkDispatcher};
use crate::link::frame::NetworkProtocol;

/// Engine whose stacks live entirely in this process.
#[derive(Debug)]
pub struct MemoryEngine {
    config: EngineConfig,
    inbound: Arc<AtomicU64>,
}

impl MemoryEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inbound: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Units injected into any channel NIC of any stack of this engine.
    pub fn inbound_packets(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl NetworkEngine for MemoryEngine {
    fn create_stack(&self) -> Result<Arc<dyn EngineStack>, EngineError> {
        if self.config.ephemeral_port_start > self.config.ephemeral_port_end {
            return Err(EngineError::new("empty ephemeral port range"));
        }
        tracing::debug!(reflect = self.config.reflect_inbound, "Memory stack created");
        Ok(Arc::new(MemoryStack {
            state: Arc::new(StackState {
                config: self.config.clone(),
                nics: Mutex::new(HashMap::new()),
                routes: Mutex::new(Vec::new()),
                listeners: Mutex::new(HashMap::new()),
                next_port: AtomicU32::new(0),
                inbound: Arc::clone(&self.inbound),
            }),
        }))
    }
}

#[derive(Debug, Default)]
struct NicEntry {
    addresses: Vec<IpNet>,
    forwarding: bool,
}

type Incoming = SyncSender<Arc<MemoryConn>>;

#[derive(Debug)]
struct StackState {
    config: EngineConfig,
    nics: Mutex<HashMap<NicId, NicEntry>>,
    routes: Mutex<Vec<Route>>,
    listeners: Mutex<HashMap<SocketAddr, Incoming>>,
    next_port: AtomicU32,
    inbound: Arc<AtomicU64>,
}

impl StackState {
    fn ephemeral_port(&self) -> u16 {
        let start = u32::from(self.config.ephemeral_port_start);
        let span = u32::from(self.config.ephemeral_port_end) - start + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // start + offset never exceeds ephemeral_port_end
        (start + offset) as u16
    }

    fn is_local(&self, ip: IpAddr) -> bool {
        let nics = self.nics.lock().expect("nic table mutex poisoned");
        nics.values()
            .flat_map(|nic| nic.addresses.iter())
            .any(|net| net.addr() == ip)
    }

    /// Pick the source address for traffic to `remote`.
    fn source_address_for(&self, remote: IpAddr) -> Option<IpAddr> {
        if self.is_local(remote) {
            return Some(remote);
        }
        let nic = {
            let routes = self.routes.lock().expect("route table mutex poisoned");
            routes
                .iter()
                .find(|route| route.destination.contains(&remote))
                .map(|route| route.nic)?
        };
        let nics = self.nics.lock().expect("nic table mutex poisoned");
        let same_family = |net: &&IpNet| net.addr().is_ipv4() == remote.is_ipv4();
        let on_route = nics
            .get(&nic)
            .and_then(|entry| entry.addresses.iter().find(same_family).map(IpNet::addr));
        on_route.or_else(|| {
            nics.values()
                .flat_map(|entry| entry.addresses.iter())
                .find(same_family)
                .map(IpNet::addr)
        })
    }

    fn lookup_listener(&self, remote: SocketAddr) -> Option<Incoming> {
        let listeners = self.listeners.lock().expect("listener table mutex poisoned");
        listeners
            .get(&remote)
            .or_else(|| listeners.get(&SocketAddr::new(unspecified_like(remote.ip()), remote.port())))
            .cloned()
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// One stack of the in-process engine.
#[derive(Debug)]
pub struct MemoryStack {
    state: Arc<StackState>,
}

impl EngineStack for MemoryStack {
    fn create_nic(&self, nic: NicId, link: LinkKind) -> Result<(), EngineError> {
        let mut nics = self.state.nics.lock().expect("nic table mutex poisoned");
        if nics.contains_key(&nic) {
            return Err(EngineError::new(format!("duplicate NIC ID {}", nic.0)));
        }
        match &link {
            LinkKind::Loopback => {}
            LinkKind::Ethernet(endpoint) | LinkKind::Ip(endpoint) => {
                endpoint.attach(Arc::new(NicDispatcher {
                    nic,
                    endpoint: Arc::downgrade(endpoint),
                    reflect: self.state.config.reflect_inbound,
                    inbound: Arc::clone(&self.state.inbound),
                }));
            }
        }
        nics.insert(nic, NicEntry::default());
        tracing::trace!(nic_id = nic.0, link = ?link, "NIC created");
        Ok(())
    }

    fn add_protocol_address(&self, nic: NicId, address: IpNet) -> Result<(), EngineError> {
        let mut nics = self.state.nics.lock().expect("nic table mutex poisoned");
        let entry = nics
            .get_mut(&nic)
            .ok_or_else(|| EngineError::new(format!("unknown NIC ID {}", nic.0)))?;
        if entry.addresses.iter().any(|existing| existing.addr() == address.addr()) {
            return Err(EngineError::new(format!("duplicate address {}", address.addr())));
        }
        entry.addresses.push(address);
        Ok(())
    }

    fn set_route_table(&self, routes: Vec<Route>) {
        *self.state.routes.lock().expect("route table mutex poisoned") = routes;
    }

    fn add_route(&self, route: Route) {
        self.state.routes.lock().expect("route table mutex poisoned").push(route);
    }

    fn set_nic_forwarding(&self, nic: NicId, enabled: bool) -> Result<(), EngineError> {
        let mut nics = self.state.nics.lock().expect("nic table mutex poisoned");
        let entry = nics
            .get_mut(&nic)
            .ok_or_else(|| EngineError::new(format!("unknown NIC ID {}", nic.0)))?;
        entry.forwarding = enabled;
        Ok(())
    }

    fn dial_tcp(&self, remote: SocketAddr) -> Result<Arc<dyn TransportConn>, EngineError> {
        let local_ip = self
            .state
            .source_address_for(remote.ip())
            .ok_or_else(|| EngineError::new(format!("connect {remote}: no route to host")))?;
        let incoming = self
            .state
            .lookup_listener(remote)
            .ok_or_else(|| EngineError::new(format!("connect {remote}: connection refused")))?;

        let local = SocketAddr::new(local_ip, self.state.ephemeral_port());
        let (client, server) = MemoryConn::pair(local, remote);
        incoming
            .send(server)
            .map_err(|_| EngineError::new(format!("connect {remote}: connection refused")))?;
        Ok(client)
    }

    fn listen_tcp(&self, local: SocketAddr) -> Result<Arc<dyn TcpAcceptor>, EngineError> {
        if !local.ip().is_unspecified() && !self.state.is_local(local.ip()) {
            return Err(EngineError::new(format!("bind {local}: address not assigned")));
        }

        let mut listeners = self.state.listeners.lock().expect("listener table mutex poisoned");
        let bound = if local.port() == 0 {
            let span = usize::from(self.state.config.ephemeral_port_end - self.state.config.ephemeral_port_start) + 1;
            (0..span)
                .map(|_| SocketAddr::new(local.ip(), self.state.ephemeral_port()))
                .find(|candidate| !listeners.contains_key(candidate))
                .ok_or_else(|| EngineError::new("no ephemeral ports available"))?
        } else {
            local
        };
        if listeners.contains_key(&bound) {
            return Err(EngineError::new(format!("bind {bound}: port is in use")));
        }

        let (tx, rx) = mpsc::sync_channel(self.state.config.accept_backlog);
        listeners.insert(bound, tx);
        Ok(Arc::new(MemoryAcceptor {
            stack: Arc::downgrade(&self.state),
            local: bound,
            incoming: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Listener handed out by [`MemoryStack::listen_tcp`].
#[derive(Debug)]
pub struct MemoryAcceptor {
    stack: Weak<StackState>,
    local: SocketAddr,
    incoming: Mutex<Receiver<Arc<MemoryConn>>>,
    closed: AtomicBool,
}

impl TcpAcceptor for MemoryAcceptor {
    fn accept(&self) -> Result<Arc<dyn TransportConn>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::new("endpoint is closed for receive"));
        }
        let incoming = self.incoming.lock().expect("accept queue mutex poisoned");
        match incoming.recv() {
            Ok(conn) if !self.closed.load(Ordering::SeqCst) => Ok(conn),
            _ => Err(EngineError::new("endpoint is closed for receive")),
        }
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::new("endpoint is already closed"));
        }
        if let Some(stack) = self.stack.upgrade() {
            // Dropping the sender wakes a blocked accept.
            stack
                .listeners
                .lock()
                .expect("listener table mutex poisoned")
                .remove(&self.local);
        }
        Ok(())
    }

    fn local_address(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.local)
    }
}

/// One side of an in-process stream.
#[derive(Debug)]
pub struct MemoryConn {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    local: SocketAddr,
    remote: SocketAddr,
    no_delay: AtomicBool,
}

impl MemoryConn {
    /// Build a connected (client, server) pair.
    pub fn pair(client_addr: SocketAddr, server_addr: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let upstream = Arc::new(Pipe::new());
        let downstream = Arc::new(Pipe::new());
        let client = Arc::new(Self {
            inbound: Arc::clone(&downstream),
            outbound: Arc::clone(&upstream),
            local: client_addr,
            remote: server_addr,
            no_delay: AtomicBool::new(false),
        });
        let server = Arc::new(Self {
            inbound: upstream,
            outbound: downstream,
            local: server_addr,
            remote: client_addr,
            no_delay: AtomicBool::new(false),
        });
        (client, server)
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        self.outbound.close_write();
        self.inbound.close_read();
    }
}

impl TransportConn for MemoryConn {
    fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        Ok(self.inbound.read(buf))
    }

    fn write(&self, buf: &[u8]) -> Result<usize, EngineError> {
        self.outbound.write(buf)
    }

    fn close(&self) -> Result<(), EngineError> {
        self.shutdown();
        Ok(())
    }

    fn local_address(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.local)
    }

    fn remote_address(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.remote)
    }

    fn set_no_delay(&self, enabled: bool) {
        self.no_delay.store(enabled, Ordering::Relaxed);
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Receives units injected into a channel NIC.
struct NicDispatcher {
    nic: NicId,
    endpoint: Weak<ChannelEndpoint>,
    reflect: bool,
    inbound: Arc<AtomicU64>,
}

impl NetworkDispatcher for NicDispatcher {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: Bytes) {
        self.inbound.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(nic_id = self.nic.0, protocol = %protocol, len = packet.len(), "Inbound unit");
        if !self.reflect {
            return;
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            if let Err(e) = endpoint.write_packet(packet) {
                tracing::debug!(nic_id = self.nic.0, error = %e, "Reflected unit dropped");
            }
        }
    }
}
