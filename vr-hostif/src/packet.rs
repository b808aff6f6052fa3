//! Forwarding-engine packet representation.
//!
//! A [`Packet`] wraps exactly one [`Frame`] and mirrors its offsets as `u16`
//! values, the width the forwarding engine works with. Adapting a frame whose
//! offsets do not fit is a drop (`InvalidPacket`).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::error::DropReason;
use crate::frame::{ChecksumState, Frame};
use crate::interface::Interface;

/// Packet flag set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Packet was originated or mirrored by the forwarding engine.
    pub const FROM_DP: Self = Self(1 << 0);
    /// Transport checksum is partial and must be finished downstream.
    pub const CSUM_PARTIAL: Self = Self(1 << 1);
    /// Deliver through the GRO queue instead of transmitting.
    pub const GRO: Self = Self(1 << 2);
    /// Frame carries a segmentation descriptor.
    pub const GSO: Self = Self(1 << 3);
    /// Flow lookup already done; skip it.
    pub const FLOW_SET: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Encapsulation of the packet as seen by the forwarding engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacketType {
    #[default]
    Null,
    /// Plain IPv4.
    Ip,
    /// Plain IPv6.
    Ip6,
    /// IPv4 payload inside an IPv4 tunnel.
    IpOverIp,
    /// IPv6 payload inside an IPv4 tunnel.
    Ip6OverIp,
    /// Anything else (ARP, L2).
    Other,
}

impl PacketType {
    /// Types whose inner network offset describes an IP header.
    pub fn has_ip_headers(self) -> bool {
        matches!(self, PacketType::Ip | PacketType::IpOverIp)
    }
}

/// Metadata a packet leaves behind when it is turned back into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub flags: PacketFlags,
    pub ptype: PacketType,
    /// Absolute offset of the outer network header.
    pub network_h: u16,
    /// Absolute offset of the inner network header.
    pub inner_network_h: u16,
}

fn offset16(value: usize) -> Option<u16> {
    u16::try_from(value).ok()
}

/// Forwarding-engine packet.
pub struct Packet {
    frame: Frame,
    data: u16,
    tail: u16,
    end: u16,
    network_h: u16,
    inner_network_h: u16,
    pub flags: PacketFlags,
    pub ptype: PacketType,
    vif: Arc<Interface>,
    cpu: usize,
}

impl Packet {
    /// Adapt a host frame. The frame is consumed on failure.
    pub fn from_frame(frame: Frame, vif: &Arc<Interface>, cpu: usize) -> Result<Self, DropReason> {
        let (Some(data), Some(tail), Some(end)) = (
            offset16(frame.data_offset()),
            offset16(frame.tail_offset()),
            offset16(frame.end_offset()),
        ) else {
            return Err(DropReason::InvalidPacket);
        };

        let mut flags = PacketFlags::empty();
        if matches!(frame.csum, ChecksumState::Partial { .. }) {
            flags.insert(PacketFlags::CSUM_PARTIAL);
        }

        Ok(Self {
            frame,
            data,
            tail,
            end,
            network_h: 0,
            inner_network_h: 0,
            flags,
            ptype: PacketType::Null,
            vif: Arc::clone(vif),
            cpu,
        })
    }

    /// Give the frame back, with `data`/`tail` synced from the packet.
    pub fn into_frame(self) -> (Frame, PacketMeta) {
        let Packet {
            mut frame,
            data,
            tail,
            network_h,
            inner_network_h,
            flags,
            ptype,
            ..
        } = self;
        // data <= tail <= end holds for every packet mutation below.
        frame.set_tail_offset(tail as usize);
        frame.set_data_offset(data as usize);
        let meta = PacketMeta {
            flags,
            ptype,
            network_h,
            inner_network_h,
        };
        (frame, meta)
    }

    pub fn vif(&self) -> &Arc<Interface> {
        &self.vif
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn len(&self) -> usize {
        (self.tail - self.data) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }

    pub fn data_offset(&self) -> u16 {
        self.data
    }

    pub fn tail_offset(&self) -> u16 {
        self.tail
    }

    pub fn end_offset(&self) -> u16 {
        self.end
    }

    pub fn data(&self) -> &[u8] {
        &self.frame.buffer()[self.data as usize..self.tail as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let (data, tail) = (self.data as usize, self.tail as usize);
        &mut self.frame.buffer_mut()[data..tail]
    }

    /// Bytes at an absolute offset, headroom included.
    pub fn bytes_at(&self, offset: u16, len: usize) -> Option<&[u8]> {
        let start = offset as usize;
        self.frame.buffer().get(start..start + len)
    }

    /// Grow the data region into the headroom by `n` bytes.
    pub fn push(&mut self, n: usize) -> Option<&mut [u8]> {
        let n16 = offset16(n)?;
        if n16 > self.data {
            return None;
        }
        self.data -= n16;
        let start = self.data as usize;
        Some(&mut self.frame.buffer_mut()[start..start + n])
    }

    /// Strip `n` bytes from the front of the data region.
    pub fn pull(&mut self, n: usize) -> bool {
        match offset16(n) {
            Some(n16) if n16 <= self.tail - self.data => {
                self.data += n16;
                true
            }
            _ => false,
        }
    }

    pub fn network_header(&self) -> u16 {
        self.network_h
    }

    pub fn set_network_header(&mut self, offset: u16) -> bool {
        if offset > self.end {
            return false;
        }
        self.network_h = offset;
        true
    }

    pub fn inner_network_header(&self) -> u16 {
        self.inner_network_h
    }

    pub fn set_inner_network_header(&mut self, offset: u16) -> bool {
        if offset > self.end {
            return false;
        }
        self.inner_network_h = offset;
        true
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Offload metadata access. Buffer offsets are owned by the packet.
    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("vif", &self.vif.idx())
            .field("data", &self.data)
            .field("tail", &self.tail)
            .field("end", &self.end)
            .field("network_h", &self.network_h)
            .field("inner_network_h", &self.inner_network_h)
            .field("flags", &self.flags)
            .field("ptype", &self.ptype)
            .field("cpu", &self.cpu)
            .finish()
    }
}
