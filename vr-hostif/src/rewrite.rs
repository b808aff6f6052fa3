//! Outer tunnel header rewrite.
//!
//! Every wire frame produced from a tunneled packet (the packet itself, or
//! each fragment/segment of it) gets its outer IPv4 total length and
//! identification refreshed here. UDP tunnels also get their UDP length
//! fixed and the UDP checksum left partial, seeded with the pseudo-header.

use std::sync::atomic::{AtomicU16, Ordering};

use smoltcp::wire::{Ipv4Packet, UdpPacket};

use crate::checksum::pseudo_header_seed;
use crate::error::DropReason;
use crate::frame::{ETH_HLEN, Frame, IPPROTO_GRE, IPPROTO_UDP, IPV4_MIN_HLEN, UDP_CSUM_OFFSET, UDP_HLEN};

/// Source of outer IPv4 identification values.
#[derive(Debug)]
pub struct IpIdGenerator {
    next: AtomicU16,
}

impl IpIdGenerator {
    pub fn new(seed: u16) -> Self {
        Self {
            next: AtomicU16::new(seed),
        }
    }

    pub fn next_id(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IpIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Outer protocol a rewrite handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterProto {
    Udp,
    Gre,
    Other(u8),
}

/// Rewrite the outer IPv4 header of an Ethernet frame.
pub fn rewrite_outer(frame: &mut Frame, ids: &IpIdGenerator) -> Result<OuterProto, DropReason> {
    if !frame.may_pull(ETH_HLEN + IPV4_MIN_HLEN) {
        return Err(DropReason::NoMemory);
    }
    let ihl = ((frame.data()[ETH_HLEN] & 0x0f) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || !frame.may_pull(ETH_HLEN + ihl) {
        return Err(DropReason::NoMemory);
    }
    let len = frame.len();
    let Ok(total_len) = u16::try_from(len - ETH_HLEN) else {
        return Err(DropReason::NoMemory);
    };

    let data = frame.data_offset();
    frame.set_network_header(data + ETH_HLEN);

    let id = ids.next_id();
    let proto = {
        let mut ip = Ipv4Packet::new_unchecked(&mut frame.data_mut()[ETH_HLEN..]);
        ip.set_total_len(total_len);
        ip.set_ident(id);
        u8::from(ip.next_header())
    };

    match proto {
        IPPROTO_UDP => {
            let l4 = ETH_HLEN + ihl;
            if !frame.may_pull(l4 + UDP_HLEN) {
                return Err(DropReason::NoMemory);
            }
            let udp_len = (len - l4) as u16;
            if !frame.set_partial_csum(l4, UDP_CSUM_OFFSET) {
                return Err(DropReason::NoMemory);
            }

            let bytes = frame.data_mut();
            Ipv4Packet::new_unchecked(&mut bytes[ETH_HLEN..]).fill_checksum();
            let seed = pseudo_header_seed(
                &bytes[ETH_HLEN + 12..ETH_HLEN + 16],
                &bytes[ETH_HLEN + 16..ETH_HLEN + 20],
                IPPROTO_UDP,
                udp_len,
            );
            let mut udp = UdpPacket::new_unchecked(&mut bytes[l4..]);
            udp.set_len(udp_len);
            udp.set_checksum(seed);
            Ok(OuterProto::Udp)
        }
        IPPROTO_GRE => {
            Ipv4Packet::new_unchecked(&mut frame.data_mut()[ETH_HLEN..]).fill_checksum();
            Ok(OuterProto::Gre)
        }
        other => {
            // Length and id changed; the header checksum must follow.
            Ipv4Packet::new_unchecked(&mut frame.data_mut()[ETH_HLEN..]).fill_checksum();
            Ok(OuterProto::Other(other))
        }
    }
}
