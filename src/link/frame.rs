//! Minimal link-layer classification for injected frames and packets.

use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

const ETHERNET_HEADER_LEN: usize = 14;

/// 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = BridgeError;

    /// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated) notation.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BridgeError::InvalidOption {
            field: "mac_address",
            reason: format!("{s:?} is not a MAC address"),
        };
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for slot in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Network protocol number carried with an inbound unit (an EtherType value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkProtocol(pub u16);

impl NetworkProtocol {
    pub const IPV4: Self = Self(0x0800);
    pub const ARP: Self = Self(0x0806);
    pub const IPV6: Self = Self(0x86DD);
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IPV4 => write!(f, "ipv4"),
            Self::ARP => write!(f, "arp"),
            Self::IPV6 => write!(f, "ipv6"),
            Self(other) => write!(f, "0x{other:04x}"),
        }
    }
}

/// Read the EtherType of an Ethernet II frame.
pub fn ethertype_of(frame: &[u8]) -> Result<NetworkProtocol> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return Err(BridgeError::Protocol(format!(
            "truncated ethernet frame: {} bytes",
            frame.len()
        )));
    }
    Ok(NetworkProtocol(u16::from_be_bytes([frame[12], frame[13]])))
}

/// Classify a raw IP packet by its version nibble.
pub fn ip_version_protocol(packet: &[u8]) -> Result<NetworkProtocol> {
    match packet.first().map(|byte| byte >> 4) {
        Some(4) => Ok(NetworkProtocol::IPV4),
        Some(6) => Ok(NetworkProtocol::IPV6),
        _ => Err(BridgeError::Protocol("unknown protocol".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_parses_and_formats() {
        let mac: MacAddress = "0A:0a:0b:0B:0c:0c".parse().unwrap();
        assert_eq!(mac.octets(), [0x0a, 0x0a, 0x0b, 0x0b, 0x0c, 0x0c]);
        assert_eq!(mac.to_string(), "0a:0a:0b:0b:0c:0c");
    }

    #[test]
    fn malformed_mac_addresses_are_rejected() {
        for input in ["", "0a:0a:0b:0b:0c", "0a:0a:0b:0b:0c:0c:0d", "zz:0a:0b:0b:0c:0c", "a:0a:0b:0b:0c:0c0"] {
            assert!(input.parse::<MacAddress>().is_err(), "{input}");
        }
    }

    #[test]
    fn ethertype_is_read_from_header() {
        let mut frame = vec![0u8; 20];
        frame[12] = 0x86;
        frame[13] = 0xdd;
        assert_eq!(ethertype_of(&frame).unwrap(), NetworkProtocol::IPV6);
    }

    #[test]
    fn short_frame_is_a_protocol_error() {
        let err = ethertype_of(&[0u8; 13]).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn ip_version_selects_protocol() {
        assert_eq!(ip_version_protocol(&[0x45, 0x00]).unwrap(), NetworkProtocol::IPV4);
        assert_eq!(ip_version_protocol(&[0x60]).unwrap(), NetworkProtocol::IPV6);
        assert!(ip_version_protocol(&[0x10]).is_err());
        assert!(ip_version_protocol(&[]).is_err());
    }
}
