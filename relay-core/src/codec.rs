//! Thin wrapper around `etherparse`. The rest of the engine never touches
//! `etherparse` types directly, so the codec crate can be swapped out here
//! without rippling through the relay logic.

use etherparse::{Ipv4Header, Ipv4HeaderSlice, IpTrafficClass, TcpHeader, TcpHeaderSlice, UdpHeader, UdpHeaderSlice};
use std::net::Ipv4Addr;

pub struct ParsedUdp<'a> {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub header: UdpHeaderSlice<'a>,
    pub payload: &'a [u8],
}

pub struct ParsedTcp<'a> {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub header: TcpHeaderSlice<'a>,
    pub payload: &'a [u8],
}

pub enum ParsedIpv4<'a> {
    Udp(ParsedUdp<'a>),
    Tcp(ParsedTcp<'a>),
    /// A protocol other than TCP/UDP (ICMP etc). Carries the IANA protocol
    /// number so callers can decide whether to drop it silently.
    Other(u8),
}

#[derive(Debug)]
pub struct CodecError(pub &'static str);

/// Parses a raw IPv4 datagram, dispatching on the embedded transport
/// protocol. Fragmented datagrams and anything shorter than a minimal
/// header are rejected with `CodecError` — the caller is expected to drop
/// the packet, not propagate a fatal error.
pub fn parse_ipv4(data: &[u8]) -> Result<ParsedIpv4<'_>, CodecError> {
    let ip = Ipv4HeaderSlice::from_slice(data).map_err(|_| CodecError("malformed ipv4 header"))?;

    if ip.more_fragments() || ip.fragments_offset() != 0 {
        return Err(CodecError("fragmented ipv4 datagram unsupported"));
    }

    let ihl = ip.ihl() as usize * 4;
    let total_len = ip.total_len() as usize;

    if total_len > data.len() || ihl > data.len() {
        return Err(CodecError("ipv4 length exceeds buffer"));
    }

    let src_addr = ip.source_addr();
    let dst_addr = ip.destination_addr();
    let body = &data[ihl..total_len];

    match ip.protocol() {
        proto if proto == IpTrafficClass::Udp as u8 => {
            let header = UdpHeaderSlice::from_slice(body).map_err(|_| CodecError("malformed udp header"))?;
            let payload = &body[header.slice().len()..];
            Ok(ParsedIpv4::Udp(ParsedUdp {
                src_addr,
                dst_addr,
                header,
                payload,
            }))
        }
        proto if proto == IpTrafficClass::Tcp as u8 => {
            let header = TcpHeaderSlice::from_slice(body).map_err(|_| CodecError("malformed tcp header"))?;
            let payload = &body[header.slice().len()..];
            Ok(ParsedIpv4::Tcp(ParsedTcp {
                src_addr,
                dst_addr,
                header,
                payload,
            }))
        }
        other => Ok(ParsedIpv4::Other(other)),
    }
}

/// Builds a UDP/IPv4 reply datagram: source/destination are swapped
/// relative to the original request (we're the remote host answering back
/// into the tunnel).
pub fn build_udp_reply(
    src_addr: Ipv4Addr,
    src_port: u16,
    dst_addr: Ipv4Addr,
    dst_port: u16,
    ip_id: u16,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    const UDP_HEADER_LEN: u16 = 8;

    if payload.len() > u16::MAX as usize - UDP_HEADER_LEN as usize {
        return Err(CodecError("udp payload too large"));
    }

    let mut ip = Ipv4Header::new(
        UDP_HEADER_LEN + payload.len() as u16,
        64,
        IpTrafficClass::Udp,
        src_addr.octets(),
        dst_addr.octets(),
    );
    ip.identification = ip_id;

    let mut udp = UdpHeader {
        source_port: src_port,
        destination_port: dst_port,
        length: UDP_HEADER_LEN + payload.len() as u16,
        checksum: 0,
    };
    udp.checksum = udp
        .calc_checksum_ipv4(&ip, payload)
        .map_err(|_| CodecError("udp checksum failed"))?;

    let mut buf = Vec::with_capacity(ip.header_len() + UDP_HEADER_LEN as usize + payload.len());
    ip.write(&mut buf).map_err(|_| CodecError("ipv4 header write failed"))?;
    udp.write(&mut buf).map_err(|_| CodecError("udp header write failed"))?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Flags for a synthesized TCP reply segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn build_tcp_reply(
    src_addr: Ipv4Addr,
    src_port: u16,
    dst_addr: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    window: u16,
    flags: TcpFlags,
    ip_id: u16,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let mut tcp = TcpHeader::new(src_port, dst_port, seq, window);
    tcp.acknowledgment_number = ack;
    tcp.syn = flags.syn;
    tcp.ack = flags.ack;
    tcp.fin = flags.fin;
    tcp.rst = flags.rst;
    tcp.psh = flags.psh;

    let mut ip = Ipv4Header::new(
        tcp.header_len() as u16 + payload.len() as u16,
        64,
        IpTrafficClass::Tcp,
        src_addr.octets(),
        dst_addr.octets(),
    );
    ip.identification = ip_id;

    tcp.checksum = tcp
        .calc_checksum_ipv4(&ip, payload)
        .map_err(|_| CodecError("tcp checksum failed"))?;

    let mut buf = Vec::with_capacity(ip.header_len() + tcp.header_len() as usize + payload.len());
    ip.write(&mut buf).map_err(|_| CodecError("ipv4 header write failed"))?;
    tcp.write(&mut buf).map_err(|_| CodecError("tcp header write failed"))?;
    buf.extend_from_slice(payload);
    Ok(buf)
}
