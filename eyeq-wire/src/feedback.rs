//! Synthetic congestion feedback packets.
//!
//! A receiver whose virtual queue is congested answers the sender with a minimal IPv4 datagram:
//! addresses swapped from the triggering packet, a fixed size and TTL, a reserved protocol number,
//! and the mark decision in the identification field. A receiver of such a packet must consume it
//! and never feed it back into the isolation logic.

use std::net::Ipv4Addr;

use pnet::util::MacAddr;

use crate::{packet::FrameBuilder, Error, Packet, Result, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN};

/// Total frame size of a feedback packet.
pub const FEEDBACK_PACKET_SIZE: usize = 64;

/// Ethernet plus IPv4 header length of a feedback packet.
pub const FEEDBACK_HEADER_SIZE: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;

pub const FEEDBACK_TTL: u8 = 64;

/// Default IP protocol number reserved for feedback.
pub const DEFAULT_FEEDBACK_IPPROTO: u8 = 143;

/// A decoded feedback packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    /// Non-zero if the receiver observed congestion.
    pub mark: u16,
}

impl Feedback {
    /// Builds the feedback addressed back to the sender of `trigger`.
    pub fn reply_to(trigger: &Packet, marked: bool) -> Result<Self> {
        let ip = trigger.ipv4().ok_or(Error::NotIpv4)?;
        let eth = trigger.ethernet().ok_or(Error::Truncated(trigger.len()))?;

        Ok(Self {
            src_mac: eth.get_destination(),
            dst_mac: eth.get_source(),
            src_ip: ip.get_destination(),
            dst_ip: ip.get_source(),
            mark: u16::from(marked),
        })
    }

    pub const fn is_marked(&self) -> bool {
        self.mark != 0
    }

    /// Encodes the feedback as a 64-byte frame under IP protocol `protocol`.
    pub fn encode(&self, protocol: u8) -> Packet {
        FrameBuilder::new()
            .src_mac(self.src_mac)
            .dst_mac(self.dst_mac)
            .src_ip(self.src_ip)
            .dst_ip(self.dst_ip)
            .ttl(FEEDBACK_TTL)
            .identification(self.mark)
            .build(protocol, &[0u8; FEEDBACK_PACKET_SIZE - FEEDBACK_HEADER_SIZE])
    }

    /// Decodes a feedback packet. Returns `None` if `packet` is not feedback under `protocol`.
    pub fn decode(packet: &Packet, protocol: u8) -> Option<Self> {
        let eth = packet.ethernet()?;
        let ip = packet.ipv4()?;
        if ip.get_next_level_protocol().0 != protocol {
            return None;
        }

        Some(Self {
            src_mac: eth.get_source(),
            dst_mac: eth.get_destination(),
            src_ip: ip.get_source(),
            dst_ip: ip.get_destination(),
            mark: ip.get_identification(),
        })
    }
}

/// Returns `true` if `packet` is a feedback packet under `protocol`.
pub fn is_feedback(packet: &Packet, protocol: u8) -> bool {
    packet.protocol() == Some(protocol)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn trigger() -> Packet {
        FrameBuilder::new()
            .src_mac(MacAddr::new(2, 0, 0, 0, 0, 1))
            .dst_mac(MacAddr::new(2, 0, 0, 0, 0, 2))
            .src_ip(Ipv4Addr::new(10, 0, 0, 1))
            .dst_ip(Ipv4Addr::new(10, 0, 0, 2))
            .build_tcp(1, 0x10, &[0u8; 1000])
    }

    #[test]
    fn reply_swaps_addresses() {
        let feedback = Feedback::reply_to(&trigger(), true).unwrap();
        let packet = feedback.encode(DEFAULT_FEEDBACK_IPPROTO);

        assert_eq!(packet.len(), FEEDBACK_PACKET_SIZE);
        assert_eq!(packet.src_ip(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(packet.dst_ip(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(packet.src_mac(), Some(MacAddr::new(2, 0, 0, 0, 0, 2)));
        assert_eq!(packet.dst_mac(), Some(MacAddr::new(2, 0, 0, 0, 0, 1)));

        let ip = packet.ipv4().unwrap();
        assert_eq!(ip.get_ttl(), FEEDBACK_TTL);
        assert_eq!(ip.get_identification(), 1);
        assert_eq!(ip.get_total_length() as usize, FEEDBACK_PACKET_SIZE - ETHERNET_HEADER_LEN);

        assert!(is_feedback(&packet, DEFAULT_FEEDBACK_IPPROTO));
        assert!(!is_feedback(&trigger(), DEFAULT_FEEDBACK_IPPROTO));
        assert_eq!(Feedback::decode(&packet, DEFAULT_FEEDBACK_IPPROTO), Some(feedback));
    }

    #[test]
    fn unmarked_feedback() {
        let feedback = Feedback::reply_to(&trigger(), false).unwrap();
        assert!(!feedback.is_marked());

        let decoded = Feedback::decode(&feedback.encode(200), 200).unwrap();
        assert!(!decoded.is_marked());
        assert!(Feedback::decode(&feedback.encode(200), DEFAULT_FEEDBACK_IPPROTO).is_none());
    }

    #[test]
    fn non_ip_trigger() {
        let packet = Packet::new(BytesMut::zeroed(64));
        assert_eq!(Feedback::reply_to(&packet, true), Err(Error::NotIpv4));
    }
}
