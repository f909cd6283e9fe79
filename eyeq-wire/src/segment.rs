//! Software segmentation of offloaded TCP super-frames.
//!
//! A frame carrying a segment size (`gso_size`) holds several MSS-sized TCP segments behind one set
//! of headers. Low-rate limiters split such frames so that a single super-frame does not exceed
//! their burst, and the backlog cap may trim one down to a whole number of segments.

use bytes::{BufMut, BytesMut};
use pnet::packet::ip::IpNextHeaderProtocols;

use crate::{
    packet::{fix_tcp_checksum, TCP_FLAGS_OFFSET},
    Error, Packet, Result,
};

const TCP_FIN: u8 = 0x01;
const TCP_PSH: u8 = 0x08;
const TCP_CWR: u8 = 0x80;
const TCP_MIN_HEADER_LEN: usize = 20;

/// Header layout of an offloaded TCP frame.
#[derive(Debug, Clone, Copy)]
struct Layout {
    gso: usize,
    /// Start of the TCP header.
    l4: usize,
    /// Ethernet, IPv4 and TCP headers.
    headers: usize,
}

fn layout(packet: &Packet) -> Result<Layout> {
    let gso = packet.gso_size().ok_or(Error::NotGso)?;
    if gso == 0 {
        return Err(Error::InvalidSegmentSize(gso));
    }

    let protocol = packet.protocol().ok_or(Error::NotIpv4)?;
    if protocol != IpNextHeaderProtocols::Tcp.0 {
        return Err(Error::NotTcp(protocol));
    }

    let l4 = packet.transport_offset().ok_or(Error::NotIpv4)?;
    let data = packet.data();
    if data.len() < l4 + TCP_MIN_HEADER_LEN {
        return Err(Error::Truncated(data.len()));
    }

    let data_offset = data[l4 + 12] >> 4;
    if (data_offset as usize) * 4 < TCP_MIN_HEADER_LEN {
        return Err(Error::InvalidDataOffset(data_offset));
    }

    let headers = l4 + data_offset as usize * 4;
    if data.len() < headers {
        return Err(Error::Truncated(data.len()));
    }

    Ok(Layout { gso: gso as usize, l4, headers })
}

/// Returns the size of the smallest frame `packet` can be cut down to: its headers plus one
/// segment. `None` if the packet cannot be segmented.
pub fn min_segment_len(packet: &Packet) -> Option<usize> {
    layout(packet).ok().map(|l| l.headers + l.gso)
}

/// Splits an offloaded TCP frame into one frame per segment.
///
/// Sequence numbers and IP identifications advance per segment, FIN and PSH are kept only on the
/// last segment and CWR only on the first. A frame that already fits in one segment is returned
/// as is, with its segment size cleared.
pub fn segment(mut packet: Packet) -> Result<Vec<Packet>> {
    let Layout { gso, l4, headers } = layout(&packet)?;

    let data = packet.data();
    if data.len() - headers <= gso {
        packet.clear_gso();
        return Ok(vec![packet]);
    }

    let seq = u32::from_be_bytes([data[l4 + 4], data[l4 + 5], data[l4 + 6], data[l4 + 7]]);
    let ip_id = packet.ipv4().map(|ip| ip.get_identification()).unwrap_or_default();
    let count = (data.len() - headers).div_ceil(gso);

    let mut segments = Vec::with_capacity(count);
    for (i, chunk) in data[headers..].chunks(gso).enumerate() {
        let mut buf = BytesMut::with_capacity(headers + chunk.len());
        buf.put_slice(&data[..headers]);
        buf.put_slice(chunk);

        let offset = (i * gso) as u32;
        buf[l4 + 4..l4 + 8].copy_from_slice(&seq.wrapping_add(offset).to_be_bytes());

        let mut flags = buf[l4 + TCP_FLAGS_OFFSET];
        if i + 1 < count {
            flags &= !(TCP_FIN | TCP_PSH);
        }
        if i > 0 {
            flags &= !TCP_CWR;
        }
        buf[l4 + TCP_FLAGS_OFFSET] = flags;

        let mut segment =
            Packet::new(buf).with_mark(packet.mark()).with_device(packet.device());
        set_ip_length(&mut segment, ip_id.wrapping_add(i as u16));
        fix_tcp_checksum(&mut segment);
        segments.push(segment);
    }

    Ok(segments)
}

/// Cuts an offloaded TCP frame down to at most `max_len` bytes, keeping whole segments. The dropped
/// tail takes the FIN flag with it.
pub fn trim(packet: &mut Packet, max_len: usize) -> Result<()> {
    let Layout { gso, l4, headers } = layout(packet)?;
    if max_len < headers + gso {
        return Err(Error::TrimTooShort(max_len));
    }

    let keep = (max_len - headers) / gso * gso;
    if headers + keep >= packet.len() {
        return Ok(());
    }

    packet.truncate(headers + keep);
    packet.data_mut()[l4 + TCP_FLAGS_OFFSET] &= !TCP_FIN;
    if keep <= gso {
        packet.clear_gso();
    }

    let ip_id = packet.ipv4().map(|ip| ip.get_identification()).unwrap_or_default();
    set_ip_length(packet, ip_id);
    fix_tcp_checksum(packet);
    Ok(())
}

fn set_ip_length(packet: &mut Packet, identification: u16) {
    let len = packet.len() - crate::ETHERNET_HEADER_LEN;
    if let Some(mut ip) = packet.ipv4_mut() {
        ip.set_total_length(len as u16);
        ip.set_identification(identification);
    }
    packet.fix_ipv4_checksum();
}
