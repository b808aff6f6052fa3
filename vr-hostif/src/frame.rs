//! Host-owned frame buffer.
//!
//! A [`Frame`] is what the host network stack hands to the datapath and what
//! the datapath hands back for transmission: one linear buffer with headroom
//! in front of `data`, the header offsets found so far and the offload
//! metadata that travels with the bytes. All header offsets are absolute,
//! measured from the start of the buffer.

use std::fmt;

/// Ethernet header length.
pub const ETH_HLEN: usize = 14;

/// Minimum IPv4 header length.
pub const IPV4_MIN_HLEN: usize = 20;

/// UDP header length.
pub const UDP_HLEN: usize = 8;

/// Minimum TCP header length.
pub const TCP_MIN_HLEN: usize = 20;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_IPV6: u16 = 0x86DD;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_GRE: u8 = 47;

/// Transport checksum field offset within a TCP header.
pub const TCP_CSUM_OFFSET: usize = 16;

/// Transport checksum field offset within a UDP header.
pub const UDP_CSUM_OFFSET: usize = 6;

/// Headroom reserved in front of frames built from wire bytes.
pub const DEFAULT_HEADROOM: usize = 128;

/// Checksum state carried with a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumState {
    /// Nothing known; the bytes carry whatever checksum they carry.
    #[default]
    None,
    /// The checksum covering `start..` must be finished and stored at
    /// `start + offset`. `start` is absolute.
    Partial { start: usize, offset: usize },
    /// Already verified.
    Unnecessary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsoKind {
    TcpV4,
    Udp,
}

/// Segmentation descriptor: the frame is a super-packet to be cut into
/// `size`-byte payload pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsoInfo {
    pub size: u16,
    pub kind: GsoKind,
    /// Number of wire segments the super-packet stands for (0 if unknown).
    pub segs: u16,
}

impl GsoInfo {
    pub fn new(size: u16, kind: GsoKind) -> Self {
        Self {
            size,
            kind,
            segs: 0,
        }
    }
}

/// Linear frame buffer with headroom.
#[derive(Clone, Default)]
pub struct Frame {
    buf: Vec<u8>,
    data: usize,
    tail: usize,
    mac_header: Option<usize>,
    network_header: Option<usize>,
    transport_header: Option<usize>,
    /// Link protocol (ethertype).
    pub protocol: u16,
    pub csum: ChecksumState,
    pub gso: Option<GsoInfo>,
    /// Flow hash; 0 means not computed.
    pub rx_hash: u32,
    /// Receive queue (core) recorded by GRO-stage steering.
    pub rx_queue: Option<usize>,
    /// Core that last handled this frame before a steering hop.
    pub last_core: Option<usize>,
    pub vlan_tci: Option<u16>,
}

impl Frame {
    /// Allocate a frame with `headroom` bytes in front of a copy of `payload`.
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = vec![0u8; headroom + payload.len()];
        buf[headroom..].copy_from_slice(payload);
        Self {
            buf,
            data: headroom,
            tail: headroom + payload.len(),
            ..Self::default()
        }
    }

    /// Build a frame from bytes received on the wire, data at the Ethernet
    /// header. The MAC header is set and the protocol is read from the
    /// ethertype.
    pub fn from_wire(bytes: &[u8]) -> Self {
        let mut frame = Self::with_headroom(DEFAULT_HEADROOM, bytes);
        frame.reset_mac_header();
        if bytes.len() >= ETH_HLEN {
            frame.protocol = u16::from_be_bytes([bytes[12], bytes[13]]);
        }
        frame
    }

    /// Length of the data region.
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }

    /// Offset of `data` from the buffer head (the headroom).
    pub fn headroom(&self) -> usize {
        self.data
    }

    pub fn data_offset(&self) -> usize {
        self.data
    }

    pub fn tail_offset(&self) -> usize {
        self.tail
    }

    /// Buffer end (capacity).
    pub fn end_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data..self.tail]
    }

    /// The whole buffer, headroom included. Header offsets index into this.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Prepend `n` bytes of headroom to the data region.
    pub fn push(&mut self, n: usize) -> bool {
        if n > self.data {
            return false;
        }
        self.data -= n;
        true
    }

    /// Strip `n` bytes from the front of the data region.
    pub fn pull(&mut self, n: usize) -> bool {
        if n > self.len() {
            return false;
        }
        self.data += n;
        true
    }

    /// True if at least `n` bytes are available from `data`.
    pub fn may_pull(&self, n: usize) -> bool {
        n <= self.len()
    }

    /// Append bytes at the tail, growing the buffer if needed.
    pub fn put(&mut self, bytes: &[u8]) {
        let end = self.tail + bytes.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.tail..end].copy_from_slice(bytes);
        self.tail = end;
    }

    /// Shrink the data region to `len` bytes.
    pub fn trim(&mut self, len: usize) {
        if len < self.len() {
            self.tail = self.data + len;
        }
    }

    /// Move `data` to an absolute offset. Fails if it would pass `tail`.
    pub fn set_data_offset(&mut self, offset: usize) -> bool {
        if offset > self.tail {
            return false;
        }
        self.data = offset;
        true
    }

    /// Move `tail` to an absolute offset. Fails outside `data..=end`.
    pub fn set_tail_offset(&mut self, offset: usize) -> bool {
        if offset < self.data || offset > self.buf.len() {
            return false;
        }
        self.tail = offset;
        true
    }

    pub fn mac_header(&self) -> Option<usize> {
        self.mac_header
    }

    pub fn set_mac_header(&mut self, offset: usize) {
        self.mac_header = Some(offset);
    }

    pub fn reset_mac_header(&mut self) {
        self.mac_header = Some(self.data);
    }

    pub fn network_header(&self) -> Option<usize> {
        self.network_header
    }

    pub fn set_network_header(&mut self, offset: usize) {
        self.network_header = Some(offset);
    }

    pub fn reset_network_header(&mut self) {
        self.network_header = Some(self.data);
    }

    pub fn transport_header(&self) -> Option<usize> {
        self.transport_header
    }

    pub fn set_transport_header(&mut self, offset: usize) {
        self.transport_header = Some(offset);
    }

    pub fn clear_headers(&mut self) {
        self.mac_header = None;
        self.network_header = None;
        self.transport_header = None;
    }

    /// Bytes between the MAC header and the network header.
    pub fn mac_len(&self) -> usize {
        match (self.mac_header, self.network_header) {
            (Some(mac), Some(net)) => net.saturating_sub(mac),
            _ => 0,
        }
    }

    /// Bytes between the network header and the transport header.
    pub fn network_header_len(&self) -> usize {
        match (self.network_header, self.transport_header) {
            (Some(net), Some(l4)) => l4.saturating_sub(net),
            _ => 0,
        }
    }

    /// Transport header offset relative to `data`.
    pub fn transport_offset(&self) -> Option<usize> {
        self.transport_header.and_then(|t| t.checked_sub(self.data))
    }

    /// Network header offset relative to `data`.
    pub fn network_offset(&self) -> Option<usize> {
        self.network_header.and_then(|n| n.checked_sub(self.data))
    }

    /// Mark the checksum partial: `start` is relative to `data`, `offset` to
    /// `start`. Fails if the checksum field is not inside the data region.
    pub fn set_partial_csum(&mut self, start: usize, offset: usize) -> bool {
        if start + offset + 2 > self.len() {
            return false;
        }
        let start = self.data + start;
        self.csum = ChecksumState::Partial { start, offset };
        self.transport_header = Some(start);
        true
    }

    /// Byte at an absolute offset, if inside the data region.
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        if offset >= self.data && offset < self.tail {
            Some(self.buf[offset])
        } else {
            None
        }
    }

    /// Big-endian u16 at an absolute offset within the data region.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        if offset >= self.data && offset + 2 <= self.tail {
            Some(u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]))
        } else {
            None
        }
    }

    /// Big-endian u32 at an absolute offset, headroom included.
    pub fn read_u32_abs(&self, offset: usize) -> Option<u32> {
        let bytes = self.buf.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> bool {
        if offset >= self.data && offset + 2 <= self.tail {
            self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
            true
        } else {
            false
        }
    }

    /// Copy of this frame's metadata with a fresh buffer.
    pub(crate) fn clone_meta(&self, buf: Vec<u8>, data: usize, tail: usize) -> Self {
        Self {
            buf,
            data,
            tail,
            mac_header: self.mac_header,
            network_header: self.network_header,
            transport_header: self.transport_header,
            protocol: self.protocol,
            csum: self.csum,
            gso: self.gso,
            rx_hash: self.rx_hash,
            rx_queue: self.rx_queue,
            last_core: self.last_core,
            vlan_tci: self.vlan_tci,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len())
            .field("data", &self.data)
            .field("tail", &self.tail)
            .field("end", &self.buf.len())
            .field("mac", &self.mac_header)
            .field("network", &self.network_header)
            .field("transport", &self.transport_header)
            .field("protocol", &format_args!("{:#06x}", self.protocol))
            .field("csum", &self.csum)
            .field("gso", &self.gso)
            .finish()
    }
}
