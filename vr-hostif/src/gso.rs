//! Software segmentation of super-packets.
//!
//! A frame carrying a [`GsoInfo`] descriptor stands for several wire
//! segments. Before cutting it, the segment size is shrunk so that each
//! segment, tunnel headers included, fits the physical MTU; otherwise every
//! segment would need fragmenting again on the way out.

use std::fmt;
use std::ops::BitOr;

use smoltcp::wire::Ipv4Packet;

use crate::checksum::{resolve_partial, transport_checksum};
use crate::error::GsoError;
use crate::fragment::fragment_with_size;
use crate::frame::{ChecksumState, Frame, GsoKind, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HLEN, TCP_MIN_HLEN};

const TCP_FLAGS_OFFSET: usize = 13;
const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_PSH: u8 = 0x08;

/// Device offload capabilities passed to a [`Segmenter`].
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadFeatures(u32);

impl OffloadFeatures {
    pub const SG: Self = Self(1 << 0);
    pub const HW_CSUM: Self = Self(1 << 1);
    pub const TSO: Self = Self(1 << 2);
    pub const UFO: Self = Self(1 << 3);
    pub const GSO: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0x1f)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Features with every segmentation offload cleared, so the segmenter
    /// does the whole job in software.
    pub const fn for_software_segmentation(self) -> Self {
        self.without(Self::TSO.union(Self::UFO).union(Self::GSO))
    }
}

impl BitOr for OffloadFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for OffloadFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SG, "SG"),
            (Self::HW_CSUM, "HW_CSUM"),
            (Self::TSO, "TSO"),
            (Self::UFO, "UFO"),
            (Self::GSO, "GSO"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OffloadFeatures({})", set.join("|"))
    }
}

/// Transport header the segment size is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentL4 {
    /// TCP: every segment repeats the TCP header.
    Tcp { header_len: usize },
    /// UDP: the datagram is fragmented; only the first piece has the header.
    Udp,
    Other,
}

/// Segment size after accounting for tunnel headers.
///
/// `seg = gso_size + mac_len + network_header_len (+ tcp header)`. If that
/// overshoots `mtu + hard_header_len` the size shrinks by the overflow; UDP
/// sizes are then rounded down to a multiple of 8.
pub fn adjusted_gso_size(
    gso_size: usize,
    mac_len: usize,
    network_header_len: usize,
    l4: SegmentL4,
    mtu: usize,
    hard_header_len: usize,
) -> usize {
    let mut seg = gso_size + mac_len + network_header_len;
    if let SegmentL4::Tcp { header_len } = l4 {
        seg += header_len;
    }
    let limit = mtu + hard_header_len;
    if seg <= limit {
        return gso_size;
    }
    let mut size = gso_size.saturating_sub(seg - limit);
    if l4 == SegmentL4::Udp {
        size &= !7;
    }
    size
}

/// Transport layout of a frame, read at its network header.
pub fn segment_l4(frame: &Frame) -> SegmentL4 {
    let Some(net) = frame.network_header() else {
        return SegmentL4::Other;
    };
    let buf = frame.buffer();
    let Some(&proto) = buf.get(net + 9) else {
        return SegmentL4::Other;
    };
    match proto {
        IPPROTO_TCP => {
            let l4 = frame
                .transport_header()
                .unwrap_or(net + ((buf[net] & 0x0f) as usize) * 4);
            match buf.get(l4 + 12) {
                Some(&doff) => SegmentL4::Tcp {
                    header_len: ((doff >> 4) as usize) * 4,
                },
                None => SegmentL4::Other,
            }
        }
        IPPROTO_UDP => SegmentL4::Udp,
        _ => SegmentL4::Other,
    }
}

/// Host segmentation facility.
pub trait Segmenter: Send + Sync {
    /// Cut a super-packet into wire segments according to its descriptor.
    fn segment(&self, frame: Frame, features: OffloadFeatures) -> Result<Vec<Frame>, GsoError>;
}

/// Segmentation in software: TCP segmentation and UDP fragmentation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftSegmenter;

impl Segmenter for SoftSegmenter {
    fn segment(&self, frame: Frame, _features: OffloadFeatures) -> Result<Vec<Frame>, GsoError> {
        let gso = frame.gso.ok_or(GsoError::NoDescriptor)?;
        if gso.size == 0 {
            return Err(GsoError::ZeroSize);
        }
        match gso.kind {
            GsoKind::TcpV4 => segment_tcp(frame, gso.size as usize),
            GsoKind::Udp => Ok(fragment_with_size(frame, gso.size as usize)?),
        }
    }
}

fn segment_tcp(mut frame: Frame, mss: usize) -> Result<Vec<Frame>, GsoError> {
    let link_len = frame.network_offset().ok_or(GsoError::Truncated)?;
    let bytes = frame.data();
    if bytes.len() < link_len + IPV4_MIN_HLEN || bytes[link_len] >> 4 != 4 {
        return Err(GsoError::Truncated);
    }
    let ip_hlen = ((bytes[link_len] & 0x0f) as usize) * 4;
    if ip_hlen < IPV4_MIN_HLEN {
        return Err(GsoError::Truncated);
    }
    if bytes[link_len + 9] != IPPROTO_TCP {
        return Err(GsoError::Unsupported);
    }
    let l4 = link_len + ip_hlen;
    if bytes.len() < l4 + TCP_MIN_HLEN {
        return Err(GsoError::Truncated);
    }
    let tcp_hlen = ((bytes[l4 + 12] >> 4) as usize) * 4;
    let hdr_len = l4 + tcp_hlen;
    if tcp_hlen < TCP_MIN_HLEN || bytes.len() < hdr_len {
        return Err(GsoError::Truncated);
    }

    // The checksum is recomputed per segment.
    if matches!(frame.csum, ChecksumState::Partial { .. }) && !resolve_partial(&mut frame) {
        return Err(GsoError::Truncated);
    }

    let bytes = frame.data();
    let header = &bytes[..hdr_len];
    let body = &bytes[hdr_len..];
    let first_id = u16::from_be_bytes([header[link_len + 4], header[link_len + 5]]);
    let first_seq = u32::from_be_bytes([header[l4 + 4], header[l4 + 5], header[l4 + 6], header[l4 + 7]]);
    let headroom = frame.headroom();

    let mut segments = Vec::with_capacity(body.len().div_ceil(mss).max(1));
    let mut chunks = body.chunks(mss).enumerate().peekable();
    while let Some((i, chunk)) = chunks.next() {
        let last = chunks.peek().is_none();
        let len = hdr_len + chunk.len();
        let mut buf = vec![0u8; headroom + len];
        let seg = &mut buf[headroom..];
        seg[..hdr_len].copy_from_slice(header);
        seg[hdr_len..].copy_from_slice(chunk);

        {
            let mut ip = Ipv4Packet::new_unchecked(&mut seg[link_len..]);
            ip.set_ident(first_id.wrapping_add(i as u16));
            ip.set_total_len((ip_hlen + tcp_hlen + chunk.len()) as u16);
            ip.fill_checksum();
        }

        let seq = first_seq.wrapping_add((mss * i) as u32);
        seg[l4 + 4..l4 + 8].copy_from_slice(&seq.to_be_bytes());
        if !last {
            seg[l4 + TCP_FLAGS_OFFSET] &= !(TCP_FLAG_FIN | TCP_FLAG_PSH);
        }
        seg[l4 + 16] = 0;
        seg[l4 + 17] = 0;
        let csum = transport_checksum(
            &seg[link_len + 12..link_len + 16],
            &seg[link_len + 16..link_len + 20],
            IPPROTO_TCP,
            &seg[l4..],
        );
        seg[l4 + 16..l4 + 18].copy_from_slice(&csum.to_be_bytes());

        let mut piece = frame.clone_meta(buf, headroom, headroom + len);
        piece.set_mac_header(headroom);
        piece.set_network_header(headroom + link_len);
        piece.set_transport_header(headroom + l4);
        piece.csum = ChecksumState::None;
        piece.gso = None;
        segments.push(piece);
    }

    Ok(segments)
}
