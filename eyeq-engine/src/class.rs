//! Traffic class identities.
//!
//! A classification scheme is chosen once, as the key type an [`Engine`](crate::Engine) is
//! instantiated with. Classification is a pure function of the packet: the same packet always
//! yields the same key.

use std::{fmt, hash::Hash, net::Ipv4Addr, str::FromStr};

use eyeq_wire::Packet;
use pnet::util::MacAddr;

use crate::Error;

/// Identity of a traffic class.
pub trait ClassKey:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + FromStr<Err = Error> + Send + Sync + 'static
{
    /// Short name of the scheme.
    const SCHEME: &'static str;

    /// Classifies an egress packet.
    fn classify_tx(packet: &Packet) -> Option<Self>;

    /// Classifies an ingress packet. For address-based schemes this looks at the destination,
    /// which is the class's own address on the receiving host.
    fn classify_rx(packet: &Packet) -> Option<Self>;

    /// Called when the class or queue owning this key is destroyed.
    fn release(&self) {}
}

/// Classifies by the device the packet was intercepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey(pub u32);

impl ClassKey for DeviceKey {
    const SCHEME: &'static str = "dev";

    fn classify_tx(packet: &Packet) -> Option<Self> {
        Some(Self(packet.device()))
    }

    fn classify_rx(packet: &Packet) -> Option<Self> {
        Some(Self(packet.device()))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self).map_err(|_| Error::InvalidKey(s.to_owned()))
    }
}

/// Classifies by Ethernet source address on egress, destination address on ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EtherSrcKey(pub MacAddr);

impl ClassKey for EtherSrcKey {
    const SCHEME: &'static str = "ether_src";

    fn classify_tx(packet: &Packet) -> Option<Self> {
        packet.src_mac().map(Self)
    }

    fn classify_rx(packet: &Packet) -> Option<Self> {
        packet.dst_mac().map(Self)
    }
}

impl fmt::Display for EtherSrcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EtherSrcKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self).map_err(|_| Error::InvalidKey(s.to_owned()))
    }
}

/// Classifies by the numeric mark the interception layer attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkKey(pub u32);

impl ClassKey for MarkKey {
    const SCHEME: &'static str = "mark";

    fn classify_tx(packet: &Packet) -> Option<Self> {
        Some(Self(packet.mark()))
    }

    fn classify_rx(packet: &Packet) -> Option<Self> {
        Some(Self(packet.mark()))
    }
}

impl fmt::Display for MarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MarkKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse(),
        };

        parsed.map(Self).map_err(|_| Error::InvalidKey(s.to_owned()))
    }
}

/// Classifies by IPv4 source address on egress, destination address on ingress. Non-IP packets
/// are not classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpKey(pub Ipv4Addr);

impl ClassKey for IpKey {
    const SCHEME: &'static str = "ip";

    fn classify_tx(packet: &Packet) -> Option<Self> {
        packet.src_ip().map(Self)
    }

    fn classify_rx(packet: &Packet) -> Option<Self> {
        packet.dst_ip().map(Self)
    }
}

impl fmt::Display for IpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IpKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self).map_err(|_| Error::InvalidKey(s.to_owned()))
    }
}
