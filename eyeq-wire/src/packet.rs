use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use pnet::{
    packet::{
        ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket},
        ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
        ipv4::{self, Ipv4Packet, MutableIpv4Packet},
        tcp::{self, MutableTcpPacket},
    },
    util::MacAddr,
};

use crate::{ecn, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN};

/// Length of a TCP header without options.
pub const TCP_HEADER_LEN: usize = 20;

/// An Ethernet frame travelling through the engine, together with the metadata the interception
/// layer attaches to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: BytesMut,
    /// Numeric mark set by the interception layer (firewall mark).
    mark: u32,
    /// Index of the device the frame was intercepted on.
    device: u32,
    /// Segment size of an offloaded TCP super-frame, if any.
    gso_size: Option<u16>,
}

impl Packet {
    pub fn new(data: BytesMut) -> Self {
        Self { data, mark: 0, device: 0, gso_size: None }
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn with_device(mut self, device: u32) -> Self {
        self.device = device;
        self
    }

    pub fn with_gso_size(mut self, gso_size: u16) -> Self {
        self.gso_size = Some(gso_size);
        self
    }

    /// Frame length in bytes. This is what the packet costs in tokens.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    pub const fn mark(&self) -> u32 {
        self.mark
    }

    pub const fn device(&self) -> u32 {
        self.device
    }

    pub const fn gso_size(&self) -> Option<u16> {
        self.gso_size
    }

    pub(crate) fn clear_gso(&mut self) {
        self.gso_size = None;
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn ethernet(&self) -> Option<EthernetPacket<'_>> {
        EthernetPacket::new(&self.data)
    }

    pub fn src_mac(&self) -> Option<MacAddr> {
        self.ethernet().map(|eth| eth.get_source())
    }

    pub fn dst_mac(&self) -> Option<MacAddr> {
        self.ethernet().map(|eth| eth.get_destination())
    }

    /// Returns `true` if this is an Ethernet frame carrying a well-formed IPv4 header.
    pub fn is_ipv4(&self) -> bool {
        self.ipv4().is_some()
    }

    /// Returns `true` if the frame claims to carry IPv4 but its header is unusable.
    pub fn is_malformed_ipv4(&self) -> bool {
        self.ethernet().is_some_and(|eth| eth.get_ethertype() == EtherTypes::Ipv4) && !self.is_ipv4()
    }

    /// Read access to the IPv4 header, if the frame carries one.
    pub fn ipv4(&self) -> Option<Ipv4Packet<'_>> {
        let eth = self.ethernet()?;
        if eth.get_ethertype() != EtherTypes::Ipv4 {
            return None;
        }

        let ip = Ipv4Packet::new(&self.data[ETHERNET_HEADER_LEN..])?;
        let ihl = ip.get_header_length() as usize * 4;
        if ip.get_version() != 4 || ihl < IPV4_HEADER_LEN || self.data.len() < ETHERNET_HEADER_LEN + ihl {
            return None;
        }

        Some(ip)
    }

    /// Write access to the IPv4 header, if the frame carries one. Callers that modify header
    /// fields must call [`Packet::fix_ipv4_checksum`] afterwards.
    pub fn ipv4_mut(&mut self) -> Option<MutableIpv4Packet<'_>> {
        if !self.is_ipv4() {
            return None;
        }

        MutableIpv4Packet::new(&mut self.data[ETHERNET_HEADER_LEN..])
    }

    pub fn src_ip(&self) -> Option<Ipv4Addr> {
        self.ipv4().map(|ip| ip.get_source())
    }

    pub fn dst_ip(&self) -> Option<Ipv4Addr> {
        self.ipv4().map(|ip| ip.get_destination())
    }

    pub fn protocol(&self) -> Option<u8> {
        self.ipv4().map(|ip| ip.get_next_level_protocol().0)
    }

    /// The full type-of-service byte (DSCP and ECN).
    pub fn tos(&self) -> Option<u8> {
        self.ipv4().map(|ip| ip.get_dscp() << 2 | ip.get_ecn())
    }

    fn set_tos(&mut self, tos: u8) -> bool {
        let Some(mut ip) = self.ipv4_mut() else {
            return false;
        };

        ip.set_dscp(tos >> 2);
        ip.set_ecn(tos & ecn::ECN_MASK);
        let csum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(csum);
        true
    }

    /// Recomputes the IPv4 header checksum.
    pub fn fix_ipv4_checksum(&mut self) {
        if let Some(mut ip) = self.ipv4_mut() {
            let csum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(csum);
        }
    }

    /// Returns `true` if the network marked this packet with congestion experienced.
    pub fn is_ce_marked(&self) -> bool {
        self.tos().is_some_and(ecn::is_ce)
    }

    /// Returns `true` if the sender piggy-backed congestion feedback on this packet.
    pub fn is_reflected(&self) -> bool {
        self.tos().is_some_and(ecn::is_reflected)
    }

    /// Marks the packet as ECN-capable. Returns `false` for non-IPv4 frames.
    pub fn set_ect(&mut self) -> bool {
        match self.tos() {
            Some(tos) => self.set_tos((tos & !ecn::ECN_MASK) | ecn::ECN_ECT0),
            None => false,
        }
    }

    /// Sets the reflect flag. Returns `false` for non-IPv4 frames.
    pub fn set_reflect(&mut self) -> bool {
        match self.tos() {
            Some(tos) => self.set_tos(tos | ecn::REFLECT_MASK),
            None => false,
        }
    }

    /// Offset of the transport header from the start of the frame.
    pub(crate) fn transport_offset(&self) -> Option<usize> {
        self.ipv4().map(|ip| ETHERNET_HEADER_LEN + ip.get_header_length() as usize * 4)
    }
}

/// Builds IPv4-over-Ethernet frames.
///
/// Mostly useful for tests and for tooling that injects traffic into an engine.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    tos: u8,
    ttl: u8,
    identification: u16,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self {
            src_mac: MacAddr::zero(),
            dst_mac: MacAddr::zero(),
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            tos: 0,
            ttl: 64,
            identification: 0,
        }
    }
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_mac(mut self, mac: MacAddr) -> Self {
        self.src_mac = mac;
        self
    }

    pub fn dst_mac(mut self, mac: MacAddr) -> Self {
        self.dst_mac = mac;
        self
    }

    pub fn src_ip(mut self, ip: Ipv4Addr) -> Self {
        self.src_ip = ip;
        self
    }

    pub fn dst_ip(mut self, ip: Ipv4Addr) -> Self {
        self.dst_ip = ip;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    /// Builds a frame whose IPv4 payload is `payload`, carried under protocol number `protocol`.
    pub fn build(&self, protocol: u8, payload: &[u8]) -> Packet {
        let ip_len = IPV4_HEADER_LEN + payload.len();
        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_LEN + ip_len);
        buf.put_bytes(0, ETHERNET_HEADER_LEN + IPV4_HEADER_LEN);
        buf.put_slice(payload);

        if let Some(mut eth) = MutableEthernetPacket::new(&mut buf) {
            eth.set_source(self.src_mac);
            eth.set_destination(self.dst_mac);
            eth.set_ethertype(EtherTypes::Ipv4);
        }

        if let Some(mut ip) = MutableIpv4Packet::new(&mut buf[ETHERNET_HEADER_LEN..]) {
            ip.set_version(4);
            ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
            ip.set_dscp(self.tos >> 2);
            ip.set_ecn(self.tos & ecn::ECN_MASK);
            ip.set_total_length(ip_len as u16);
            ip.set_identification(self.identification);
            ip.set_ttl(self.ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocol(protocol));
            ip.set_source(self.src_ip);
            ip.set_destination(self.dst_ip);
            let csum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(csum);
        }

        Packet::new(buf)
    }

    /// Builds a TCP segment carrying `data`, with a valid TCP checksum.
    pub fn build_tcp(&self, seq: u32, flags: u8, data: &[u8]) -> Packet {
        let mut payload = vec![0u8; TCP_HEADER_LEN + data.len()];
        payload[TCP_HEADER_LEN..].copy_from_slice(data);

        if let Some(mut tcp) = MutableTcpPacket::new(&mut payload) {
            tcp.set_source(40_000);
            tcp.set_destination(5001);
            tcp.set_sequence(seq);
            tcp.set_data_offset((TCP_HEADER_LEN / 4) as u8);
            tcp.set_window(u16::MAX);
        }
        payload[TCP_FLAGS_OFFSET] = flags;

        let mut packet = self.build(IpNextHeaderProtocols::Tcp.0, &payload);
        fix_tcp_checksum(&mut packet);
        packet
    }
}

/// Offset of the flags byte within a TCP header.
pub(crate) const TCP_FLAGS_OFFSET: usize = 13;

/// Recomputes the TCP checksum of an IPv4 TCP frame. No-op for anything else.
pub(crate) fn fix_tcp_checksum(packet: &mut Packet) {
    let (Some(src), Some(dst), Some(offset)) =
        (packet.src_ip(), packet.dst_ip(), packet.transport_offset())
    else {
        return;
    };

    if let Some(mut tcp) = MutableTcpPacket::new(&mut packet.data_mut()[offset..]) {
        let csum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
        tcp.set_checksum(csum);
    }
}
