//! TCP segment coalescing.
//!
//! Frames reaching the merger have `data` at the IPv4 header and the 4-byte
//! label header at the MAC header offset. In-order segments of one TCP flow
//! carrying the same label are joined into a single super-packet with a
//! segmentation descriptor, the way a NIC's receive offload would.

use smoltcp::wire::Ipv4Packet;

use super::GroMerger;
use crate::checksum::{ipv4_transport_checksum_valid, transport_checksum};
use crate::frame::{ChecksumState, Frame, GsoInfo, GsoKind, IPPROTO_TCP, TCP_MIN_HLEN};

/// Flows held at once; the oldest is flushed to make room.
const MAX_FLOWS: usize = 8;

/// Largest IPv4 total length a merged packet may reach.
const MAX_MERGED_LEN: usize = 65_535;

/// Largest buffer end, headroom included, the packet representation accepts.
const MAX_MERGED_END: usize = u16::MAX as usize;

const TCP_FLAG_PSH: u8 = 0x08;
const TCP_FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowKey {
    label: Option<u32>,
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
}

#[derive(Debug, Clone, Copy)]
struct TcpSegment {
    key: FlowKey,
    seq: u32,
    ack: u32,
    flags: u8,
    ip_hlen: usize,
    tcp_hlen: usize,
    payload_len: usize,
}

impl TcpSegment {
    /// Parse an unfragmented IPv4/TCP packet at `frame.data()`.
    fn parse(frame: &Frame) -> Option<Self> {
        let bytes = frame.data();
        let ip = Ipv4Packet::new_checked(bytes).ok()?;
        if ip.version() != 4 || ip.more_frags() || ip.frag_offset() != 0 {
            return None;
        }
        if u8::from(ip.next_header()) != IPPROTO_TCP {
            return None;
        }
        let ip_hlen = ip.header_len() as usize;
        let total = ip.total_len() as usize;
        let tcp = bytes.get(ip_hlen..total)?;
        if tcp.len() < TCP_MIN_HLEN {
            return None;
        }
        let tcp_hlen = ((tcp[12] >> 4) as usize) * 4;
        if tcp_hlen < TCP_MIN_HLEN || tcp_hlen > tcp.len() {
            return None;
        }

        let label = frame
            .mac_header()
            .filter(|&mac| mac + 4 <= frame.data_offset())
            .and_then(|mac| frame.read_u32_abs(mac));

        Some(Self {
            key: FlowKey {
                label,
                src: [bytes[12], bytes[13], bytes[14], bytes[15]],
                dst: [bytes[16], bytes[17], bytes[18], bytes[19]],
                src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
                dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            },
            seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
            flags: tcp[13],
            ip_hlen,
            tcp_hlen,
            payload_len: tcp.len() - tcp_hlen,
        })
    }

    /// Pure data segment with a trustworthy checksum and no trailing bytes.
    fn mergeable(&self, frame: &Frame) -> bool {
        if self.payload_len == 0 {
            return false;
        }
        if self.flags & TCP_FLAG_ACK == 0 || self.flags & !(TCP_FLAG_ACK | TCP_FLAG_PSH) != 0 {
            return false;
        }
        if self.ip_hlen + self.tcp_hlen + self.payload_len != frame.len() {
            return false;
        }
        match frame.csum {
            ChecksumState::Unnecessary => true,
            ChecksumState::Partial { .. } => false,
            ChecksumState::None => ipv4_transport_checksum_valid(frame.data()),
        }
    }

    fn psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }
}

struct Held {
    frame: Frame,
    key: FlowKey,
    next_seq: u32,
    ack: u32,
    ip_hlen: usize,
    tcp_hlen: usize,
    seg_size: usize,
    segs: u16,
    closed: bool,
}

impl Held {
    fn new(seg: TcpSegment, frame: Frame) -> Self {
        Self {
            frame,
            key: seg.key,
            next_seq: seg.seq.wrapping_add(seg.payload_len as u32),
            ack: seg.ack,
            ip_hlen: seg.ip_hlen,
            tcp_hlen: seg.tcp_hlen,
            seg_size: seg.payload_len,
            segs: 1,
            closed: seg.psh(),
        }
    }

    fn can_append(&self, seg: &TcpSegment, frame: &Frame) -> bool {
        if self.closed
            || seg.seq != self.next_seq
            || seg.ack != self.ack
            || seg.ip_hlen != self.ip_hlen
            || seg.tcp_hlen != self.tcp_hlen
            || seg.payload_len > self.seg_size
            || self.frame.len() + seg.payload_len > MAX_MERGED_LEN
            || self.merged_end(seg.payload_len) > MAX_MERGED_END
        {
            return false;
        }
        let a = self.frame.data();
        let b = frame.data();
        // TOS, DF and TTL must match, as must IP and TCP options.
        a[1] == b[1]
            && a[6] & 0x40 == b[6] & 0x40
            && a[8] == b[8]
            && a[20..self.ip_hlen] == b[20..seg.ip_hlen]
            && a[self.ip_hlen + TCP_MIN_HLEN..self.ip_hlen + self.tcp_hlen]
                == b[seg.ip_hlen + TCP_MIN_HLEN..seg.ip_hlen + seg.tcp_hlen]
    }

    /// Buffer end after appending `payload_len` bytes.
    fn merged_end(&self, payload_len: usize) -> usize {
        self.frame
            .end_offset()
            .max(self.frame.tail_offset() + payload_len)
    }

    fn append(&mut self, seg: TcpSegment, frame: Frame) {
        let payload_at = seg.ip_hlen + seg.tcp_hlen;
        self.frame.put(&frame.data()[payload_at..]);
        self.next_seq = self.next_seq.wrapping_add(seg.payload_len as u32);
        self.segs = self.segs.saturating_add(1);
        if seg.psh() {
            self.frame.data_mut()[self.ip_hlen + 13] |= TCP_FLAG_PSH;
        }
        if seg.psh() || seg.payload_len < self.seg_size {
            self.closed = true;
        }
    }

    /// Rewrite lengths and checksums of a merged packet.
    fn finish(mut self) -> Frame {
        if self.segs == 1 {
            return self.frame;
        }
        let len = self.frame.len();
        let ip_hlen = self.ip_hlen;
        let data = self.frame.data_mut();
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut data[..]);
            ip.set_total_len(len as u16);
            ip.fill_checksum();
        }
        let csum_at = ip_hlen + 16;
        data[csum_at] = 0;
        data[csum_at + 1] = 0;
        let csum = transport_checksum(&data[12..16], &data[16..20], IPPROTO_TCP, &data[ip_hlen..len]);
        data[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes());

        self.frame.csum = ChecksumState::Unnecessary;
        self.frame.gso = Some(GsoInfo {
            size: self.seg_size as u16,
            kind: GsoKind::TcpV4,
            segs: self.segs,
        });
        self.frame
    }
}

/// GRO merger joining in-order TCP segments of a flow.
#[derive(Default)]
pub struct TcpCoalescer {
    held: Vec<Held>,
}

impl TcpCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flows currently held back.
    pub fn held_flows(&self) -> usize {
        self.held.len()
    }

    fn flush_flow(&mut self, key: &FlowKey, out: &mut Vec<Frame>) {
        if let Some(pos) = self.held.iter().position(|h| h.key == *key) {
            out.push(self.held.remove(pos).finish());
        }
    }
}

impl GroMerger for TcpCoalescer {
    fn receive(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Some(seg) = TcpSegment::parse(&frame) else {
            out.push(frame);
            return;
        };
        if !seg.mergeable(&frame) {
            // FIN, RST, pure ACKs and the like overtake nothing of their flow.
            self.flush_flow(&seg.key, out);
            out.push(frame);
            return;
        }

        if let Some(pos) = self.held.iter().position(|h| h.key == seg.key) {
            if self.held[pos].can_append(&seg, &frame) {
                self.held[pos].append(seg, frame);
                return;
            }
            out.push(self.held.remove(pos).finish());
        }
        if self.held.len() == MAX_FLOWS {
            out.push(self.held.remove(0).finish());
        }
        self.held.push(Held::new(seg, frame));
    }

    fn flush(&mut self, out: &mut Vec<Frame>) {
        out.extend(self.held.drain(..).map(Held::finish));
    }
}
