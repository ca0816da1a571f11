//! Tap, tun and loopback interfaces attached to a stack.

use std::sync::Arc;

use bytes::Bytes;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::engine::{EngineStack, LinkKind, NicId, Route};
use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::host::{DeferredInvoker, Event, HostObject};
use crate::link::frame::{ethertype_of, ip_version_protocol};
use crate::link::{ChannelEndpoint, MacAddress, PacketPump, PumpTarget};
use crate::stack::context::StackContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Loopback,
    Tap,
    Tun,
}

/// Interface construction options, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceOptions {
    Loopback {
        ip_address: Option<String>,
        #[serde(default)]
        forwarding: bool,
    },
    Tap {
        ip_network: Option<String>,
        mac_address: Option<String>,
        #[serde(default)]
        forwarding: bool,
    },
    Tun {
        ip_network: Option<String>,
        #[serde(default)]
        forwarding: bool,
    },
}

impl InterfaceOptions {
    pub fn loopback(ip_address: impl Into<String>) -> Self {
        Self::Loopback {
            ip_address: Some(ip_address.into()),
            forwarding: false,
        }
    }

    pub fn tap(ip_network: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self::Tap {
            ip_network: Some(ip_network.into()),
            mac_address: Some(mac_address.into()),
            forwarding: false,
        }
    }

    pub fn tun(ip_network: impl Into<String>) -> Self {
        Self::Tun {
            ip_network: Some(ip_network.into()),
            forwarding: false,
        }
    }

    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        match &mut self {
            Self::Loopback { forwarding, .. } | Self::Tap { forwarding, .. } | Self::Tun { forwarding, .. } => {
                *forwarding = enabled;
            }
        }
        self
    }
}

/// Native side of one interface.
#[derive(Debug)]
pub enum InterfaceBinding {
    Loopback {
        nic: NicId,
    },
    Tap {
        nic: NicId,
        endpoint: Arc<ChannelEndpoint>,
        _pump: Arc<PacketPump>,
    },
    Tun {
        nic: NicId,
        endpoint: Arc<ChannelEndpoint>,
        _pump: Arc<PacketPump>,
    },
}

impl InterfaceBinding {
    /// Validate `options`, create the NIC and start its pump.
    ///
    /// The NIC id is the interface handle plus one; NIC 1 belongs to the stack.
    pub(crate) fn build(
        context: &StackContext,
        id: Handle,
        options: &InterfaceOptions,
        invoker: DeferredInvoker,
    ) -> Result<Self> {
        let nic = id
            .as_u32()
            .checked_add(1)
            .map(NicId)
            .ok_or(BridgeError::HandlesExhausted)?;
        let engine = context.engine();
        let link = &context.config().link;
        let object = HostObject::Interface {
            stack: context.id(),
            interface: id,
        };

        let binding = match options {
            InterfaceOptions::Loopback { ip_address, forwarding } => {
                let address: IpNet = required(ip_address, "ip_address")?.parse()?;
                engine.create_nic(nic, LinkKind::Loopback)?;
                configure(engine.as_ref(), nic, address, *forwarding)?;
                Self::Loopback { nic }
            }
            InterfaceOptions::Tap {
                ip_network,
                mac_address,
                forwarding,
            } => {
                let network: IpNet = required(ip_network, "ip_network")?.parse()?;
                let mac: MacAddress = required(mac_address, "mac_address")?.parse()?;
                let endpoint = Arc::new(ChannelEndpoint::new(link.queue_depth, link.mtu, Some(mac)));
                engine.create_nic(nic, LinkKind::Ethernet(Arc::clone(&endpoint)))?;
                configure(engine.as_ref(), nic, network, *forwarding)?;
                let pump = PacketPump::start(
                    Arc::clone(&endpoint),
                    link.pump_depth,
                    invoker,
                    PumpTarget {
                        object,
                        make_event: Event::Frame,
                        direction: "tap",
                    },
                );
                Self::Tap {
                    nic,
                    endpoint,
                    _pump: pump,
                }
            }
            InterfaceOptions::Tun { ip_network, forwarding } => {
                let network: IpNet = required(ip_network, "ip_network")?.parse()?;
                let endpoint = Arc::new(ChannelEndpoint::new(link.queue_depth, link.mtu, None));
                engine.create_nic(nic, LinkKind::Ip(Arc::clone(&endpoint)))?;
                configure(engine.as_ref(), nic, network, *forwarding)?;
                let pump = PacketPump::start(
                    Arc::clone(&endpoint),
                    link.pump_depth,
                    invoker,
                    PumpTarget {
                        object,
                        make_event: Event::Packet,
                        direction: "tun",
                    },
                );
                Self::Tun {
                    nic,
                    endpoint,
                    _pump: pump,
                }
            }
        };
        Ok(binding)
    }

    pub fn kind(&self) -> InterfaceKind {
        match self {
            Self::Loopback { .. } => InterfaceKind::Loopback,
            Self::Tap { .. } => InterfaceKind::Tap,
            Self::Tun { .. } => InterfaceKind::Tun,
        }
    }

    pub fn nic(&self) -> NicId {
        match self {
            Self::Loopback { nic } | Self::Tap { nic, .. } | Self::Tun { nic, .. } => *nic,
        }
    }

    pub fn endpoint(&self) -> Option<&Arc<ChannelEndpoint>> {
        match self {
            Self::Loopback { .. } => None,
            Self::Tap { endpoint, .. } | Self::Tun { endpoint, .. } => Some(endpoint),
        }
    }

    /// Hand an inbound frame (tap) or packet (tun) to the engine.
    pub fn inject(&self, unit: Bytes) -> Result<()> {
        match self {
            Self::Loopback { .. } => Err(BridgeError::Protocol(
                "loopback interfaces do not accept injected traffic".to_string(),
            )),
            Self::Tap { endpoint, .. } => {
                let protocol = ethertype_of(&unit)?;
                Ok(endpoint.inject_inbound(protocol, unit)?)
            }
            Self::Tun { endpoint, .. } => {
                let protocol = ip_version_protocol(&unit)?;
                Ok(endpoint.inject_inbound(protocol, unit)?)
            }
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    value.as_deref().ok_or(BridgeError::MissingOption(name))
}

fn configure(engine: &dyn EngineStack, nic: NicId, address: IpNet, forwarding: bool) -> Result<()> {
    engine.add_protocol_address(nic, address)?;
    engine.add_route(Route {
        destination: address.trunc(),
        nic,
    });
    if forwarding {
        engine.set_nic_forwarding(nic, true)?;
    }
    Ok(())
}
