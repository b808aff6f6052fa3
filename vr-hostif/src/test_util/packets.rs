//! Packet builders for tests and the self-test
//!
//! Uses smoltcp for header construction. Tunneled frames are MPLS over UDP:
//! Ethernet, outer IPv4, UDP to [`MPLS_UDP_PORT`], a 4-byte label header and
//! the inner IPv4 packet.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::checksum::transport_checksum;
use crate::frame::{ETH_HLEN, Frame, IPPROTO_TCP, IPV4_MIN_HLEN, TCP_MIN_HLEN, UDP_HLEN};
use crate::router::{LABEL_HDR_LEN, label_header};

/// UDP destination port for MPLS over UDP
pub const MPLS_UDP_PORT: u16 = 6635;

/// Ethernet + outer IPv4 + UDP + label header
pub const TUNNEL_HDR_LEN: usize = ETH_HLEN + IPV4_MIN_HLEN + UDP_HLEN + LABEL_HDR_LEN;

pub const HOST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

pub const OUTER_SRC: [u8; 4] = [192, 0, 2, 1];
pub const OUTER_DST: [u8; 4] = [192, 0, 2, 2];
pub const INNER_SRC: [u8; 4] = [10, 0, 0, 1];
pub const INNER_DST: [u8; 4] = [10, 0, 0, 2];

/// TCP flag bits
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

fn addr(octets: [u8; 4]) -> Ipv4Address {
    Ipv4Address::new(octets[0], octets[1], octets[2], octets[3])
}

/// Emit an IPv4 header for `payload_len` bytes into `buf` with the given id.
fn emit_ipv4(buf: &mut [u8], src: [u8; 4], dst: [u8; 4], proto: IpProtocol, payload_len: usize, ident: u16) {
    let repr = Ipv4Repr {
        src_addr: addr(src),
        dst_addr: addr(dst),
        next_header: proto,
        payload_len,
        hop_limit: 64,
    };
    let mut ip = Ipv4Packet::new_unchecked(buf);
    repr.emit(&mut ip, &ChecksumCapabilities::default());
    ip.set_ident(ident);
    ip.set_dont_frag(false);
    ip.fill_checksum();
}

/// Inner IPv4/TCP segment with valid checksums.
pub fn tcp_segment(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut tcp = vec![0u8; TCP_MIN_HLEN + payload.len()];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((TCP_MIN_HLEN / 4) as u8) << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&0xffffu16.to_be_bytes());
    tcp[TCP_MIN_HLEN..].copy_from_slice(payload);
    let csum = transport_checksum(&INNER_SRC, &INNER_DST, IPPROTO_TCP, &tcp);
    tcp[16..18].copy_from_slice(&csum.to_be_bytes());

    let mut packet = vec![0u8; IPV4_MIN_HLEN + tcp.len()];
    emit_ipv4(&mut packet, INNER_SRC, INNER_DST, IpProtocol::Tcp, tcp.len(), 0x4000);
    packet[IPV4_MIN_HLEN..].copy_from_slice(&tcp);
    packet
}

/// Inner IPv4/UDP datagram with valid checksums.
pub fn udp_datagram(src_port: u16, dst_port: u16, ident: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HLEN + payload.len();
    let mut packet = vec![0u8; IPV4_MIN_HLEN + udp_len];
    emit_ipv4(&mut packet, INNER_SRC, INNER_DST, IpProtocol::Udp, udp_len, ident);

    let repr = UdpRepr { src_port, dst_port };
    let mut udp = UdpPacket::new_unchecked(&mut packet[IPV4_MIN_HLEN..]);
    repr.emit(
        &mut udp,
        &addr(INNER_SRC).into(),
        &addr(INNER_DST).into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    packet
}

/// Wrap an inner IPv4 packet in Ethernet/IPv4/UDP/label headers.
pub fn mpls_over_udp(label: u32, inner: &[u8]) -> Vec<u8> {
    let udp_payload = LABEL_HDR_LEN + inner.len();
    let ip_payload = UDP_HLEN + udp_payload;
    let mut packet = vec![0u8; ETH_HLEN + IPV4_MIN_HLEN + ip_payload];

    let eth = EthernetRepr {
        src_addr: EthernetAddress(PEER_MAC),
        dst_addr: EthernetAddress(HOST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth.emit(&mut frame);

    emit_ipv4(
        &mut packet[ETH_HLEN..],
        OUTER_SRC,
        OUTER_DST,
        IpProtocol::Udp,
        ip_payload,
        0,
    );

    let l4 = ETH_HLEN + IPV4_MIN_HLEN;
    {
        let mut udp = UdpPacket::new_unchecked(&mut packet[l4..]);
        udp.set_src_port(49152);
        udp.set_dst_port(MPLS_UDP_PORT);
        udp.set_len(ip_payload as u16);
        udp.set_checksum(0);
    }
    let label_at = l4 + UDP_HLEN;
    packet[label_at..label_at + LABEL_HDR_LEN].copy_from_slice(&label_header(label).to_be_bytes());
    packet[TUNNEL_HDR_LEN..].copy_from_slice(inner);
    packet
}

/// Tunneled UDP packet of exactly `total_len` bytes on the wire.
pub fn tunneled_udp(label: u32, total_len: usize, ident: u16) -> Vec<u8> {
    let payload_len = total_len.saturating_sub(TUNNEL_HDR_LEN + IPV4_MIN_HLEN + UDP_HLEN);
    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    mpls_over_udp(label, &udp_datagram(5000, 5001, ident, &payload))
}

/// Host frame for a tunneled packet with network headers at the outer and
/// inner IPv4 headers.
pub fn tunneled_frame(bytes: &[u8]) -> Frame {
    let mut frame = Frame::from_wire(bytes);
    frame.set_network_header(frame.data_offset() + ETH_HLEN);
    frame
}

/// IPv4 header view at `offset` into `bytes`.
pub fn ipv4_at(bytes: &[u8], offset: usize) -> Option<Ipv4Packet<&[u8]>> {
    Ipv4Packet::new_checked(bytes.get(offset..)?).ok()
}
