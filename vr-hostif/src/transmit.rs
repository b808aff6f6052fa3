//! Transmit dispatcher.
//!
//! Frames handed back by the forwarding engine end up here. Each frame is
//! sent as is, cut into segments (GSO), or fragmented to fit the wire MTU;
//! every resulting wire frame of an IP-over-IP tunnel gets its outer header
//! rewritten before it reaches the host device.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{DropReason, TxError};
use crate::fragment::fragment;
use crate::frame::{
    ChecksumState, ETH_HLEN, ETH_P_IP, Frame, IPPROTO_TCP, IPPROTO_UDP, TCP_CSUM_OFFSET,
    UDP_CSUM_OFFSET,
};
use crate::gso::{OffloadFeatures, Segmenter, SoftSegmenter, adjusted_gso_size, segment_l4};
use crate::interface::{DeviceHandle, Interface, VifType};
use crate::packet::{PacketFlags, PacketMeta, PacketType};
use crate::rewrite::{IpIdGenerator, rewrite_outer};
use crate::stats::DropStats;

/// How a single wire frame leaves the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPlan {
    /// Hand the frame to the device unchanged.
    Direct,
    /// Fragment the IPv4 packet to the device MTU.
    Fragment,
    /// Oversized and not IPv4: nothing can be done.
    Unsupported,
}

impl TxPlan {
    /// Pick a plan. Only physical interfaces enforce the wire limit
    /// (`mtu + hard_header_len`).
    pub fn select(kind: VifType, protocol: u16, len: usize, limit: usize) -> Self {
        if kind != VifType::Physical || len <= limit {
            TxPlan::Direct
        } else if protocol == ETH_P_IP {
            TxPlan::Fragment
        } else {
            TxPlan::Unsupported
        }
    }
}

pub(crate) fn tx_drop_reason(err: &TxError) -> DropReason {
    match err {
        TxError::DeviceDown(_) => DropReason::InterfaceDown,
        TxError::QueueFull => DropReason::QueueFull,
        TxError::Rejected(_) | TxError::Io(_) => DropReason::NoMemory,
    }
}

/// Wire-side transmit machinery shared by all cores.
pub struct Transmitter {
    ids: IpIdGenerator,
    segmenter: Box<dyn Segmenter>,
    features: OffloadFeatures,
    drops: Arc<DropStats>,
}

impl Transmitter {
    pub fn new(drops: Arc<DropStats>) -> Self {
        Self::with_segmenter(drops, Box::new(SoftSegmenter))
    }

    pub fn with_segmenter(drops: Arc<DropStats>, segmenter: Box<dyn Segmenter>) -> Self {
        Self {
            ids: IpIdGenerator::default(),
            segmenter,
            features: OffloadFeatures::all(),
            drops,
        }
    }

    /// Device offload features advertised to the segmenter.
    pub fn set_features(&mut self, features: OffloadFeatures) {
        self.features = features;
    }

    pub fn drops(&self) -> &Arc<DropStats> {
        &self.drops
    }

    fn drop_frame(&self, vif: &Interface, reason: DropReason) -> DropReason {
        self.drops.record(reason);
        trace!(vif = %vif, reason = %reason, "Dropped frame on transmit");
        reason
    }

    /// Prepare the frame's header offsets and checksum state from the
    /// packet metadata, then segment or send it.
    ///
    /// For `Ip`/`IpOverIp` packets the network header is the inner network
    /// header. A partial checksum is pointed at the TCP or UDP checksum
    /// field, otherwise the checksum state is cleared.
    pub fn send(&self, vif: &Interface, mut frame: Frame, meta: PacketMeta) -> Result<(), DropReason> {
        frame.reset_mac_header();

        if meta.ptype.has_ip_headers() {
            let net = meta.inner_network_h as usize;
            let (Some(vhl), Some(proto)) = (frame.byte_at(net), frame.byte_at(net + 9)) else {
                return Err(self.drop_frame(vif, DropReason::InvalidPacket));
            };
            let l4 = net + ((vhl & 0x0f) as usize) * 4;
            frame.set_network_header(net);
            frame.set_transport_header(l4);

            if meta.flags.contains(PacketFlags::CSUM_PARTIAL) {
                let offset = match (proto, frame.csum) {
                    (IPPROTO_TCP, _) => Some(TCP_CSUM_OFFSET),
                    (IPPROTO_UDP, _) => Some(UDP_CSUM_OFFSET),
                    (_, ChecksumState::Partial { offset, .. }) => Some(offset),
                    _ => None,
                };
                let start = l4 - frame.data_offset();
                if !offset.is_some_and(|offset| frame.set_partial_csum(start, offset)) {
                    frame.csum = ChecksumState::None;
                }
            } else {
                frame.csum = ChecksumState::None;
            }

            if meta.flags.contains(PacketFlags::GSO) && frame.gso.is_some() && vif.is_physical() {
                self.gso_xmit(vif, frame, meta.ptype);
                return Ok(());
            }
        }

        self.xmit_segment(vif, frame, meta.ptype)
    }

    /// Segment a super-packet in software and send the segments in order.
    ///
    /// The segment size is shrunk so that no segment needs fragmenting once
    /// the tunnel headers are accounted for. Segmentation failures drop the
    /// frame without reporting upward.
    pub fn gso_xmit(&self, vif: &Interface, mut frame: Frame, ty: PacketType) {
        let Some(device) = vif.device() else {
            self.drop_frame(vif, DropReason::InterfaceDown);
            return;
        };
        let Some(mut gso) = frame.gso else {
            self.drop_frame(vif, DropReason::GsoFailed);
            return;
        };

        let adjusted = adjusted_gso_size(
            gso.size as usize,
            frame.mac_len(),
            frame.network_header_len(),
            segment_l4(&frame),
            device.mtu(),
            device.hard_header_len(),
        );
        if adjusted != gso.size as usize {
            trace!(vif = %vif, from = gso.size, to = adjusted, "Shrinking segment size");
        }
        gso.size = adjusted as u16;
        frame.gso = Some(gso);

        match self
            .segmenter
            .segment(frame, self.features.for_software_segmentation())
        {
            Ok(segments) if !segments.is_empty() => {
                let _ = self.xmit_segments(vif, segments, ty);
            }
            Ok(_) => {
                self.drop_frame(vif, DropReason::GsoFailed);
            }
            Err(e) => {
                debug!(vif = %vif, error = %e, "Segmentation failed");
                self.drop_frame(vif, DropReason::GsoFailed);
            }
        }
    }

    /// Send segments strictly in order. The first failure stops the run and
    /// every segment not yet sent is dropped. Returns the number sent.
    pub fn xmit_segments(
        &self,
        vif: &Interface,
        segments: Vec<Frame>,
        ty: PacketType,
    ) -> Result<usize, DropReason> {
        let total = segments.len();
        let mut segments = segments.into_iter();
        let mut sent = 0;
        while let Some(segment) = segments.next() {
            if let Err(reason) = self.xmit_segment(vif, segment, ty) {
                let rest = segments.len();
                self.drops.record_n(reason, rest as u64);
                debug!(vif = %vif, sent, dropped = rest + 1, total, "Segment run aborted");
                return Err(reason);
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Send one segment. Tunneled frames that fit the wire get their outer
    /// header rewritten first; oversized ones are rewritten per fragment.
    pub fn xmit_segment(&self, vif: &Interface, mut frame: Frame, ty: PacketType) -> Result<(), DropReason> {
        let Some(device) = vif.device() else {
            return Err(self.drop_frame(vif, DropReason::InterfaceDown));
        };
        let limit = device.mtu() + device.hard_header_len();
        if ty != PacketType::IpOverIp || frame.len() > limit {
            return self.xmit_on(vif, &device, frame, ty);
        }

        rewrite_outer(&mut frame, &self.ids).map_err(|reason| self.drop_frame(vif, reason))?;
        self.xmit_on(vif, &device, frame, ty)
    }

    /// Send one wire frame, fragmenting oversized IPv4 frames on physical
    /// interfaces.
    pub fn xmit(&self, vif: &Interface, frame: Frame, ty: PacketType) -> Result<(), DropReason> {
        let Some(device) = vif.device() else {
            return Err(self.drop_frame(vif, DropReason::InterfaceDown));
        };
        self.xmit_on(vif, &device, frame, ty)
    }

    fn xmit_on(
        &self,
        vif: &Interface,
        device: &DeviceHandle,
        mut frame: Frame,
        ty: PacketType,
    ) -> Result<(), DropReason> {
        let limit = device.mtu() + device.hard_header_len();
        match TxPlan::select(vif.kind(), frame.protocol, frame.len(), limit) {
            TxPlan::Direct => self.queue(vif, device, frame),
            TxPlan::Fragment => {
                if frame.network_header().is_none() {
                    frame.set_network_header(frame.data_offset() + ETH_HLEN);
                }
                match fragment(frame, device.mtu()) {
                    Ok(fragments) => self.xmit_segments(vif, fragments, ty).map(|_| ()),
                    Err(e) => {
                        debug!(vif = %vif, error = %e, "Fragmentation failed");
                        Err(self.drop_frame(vif, DropReason::NoMemory))
                    }
                }
            }
            TxPlan::Unsupported => Err(self.drop_frame(vif, DropReason::NoMemory)),
        }
    }

    fn queue(&self, vif: &Interface, device: &DeviceHandle, frame: Frame) -> Result<(), DropReason> {
        let len = frame.len();
        match device.queue_xmit(frame) {
            Ok(()) => {
                vif.counters().record_tx(len);
                Ok(())
            }
            Err(e) => {
                debug!(vif = %vif, device = device.name(), error = %e, "Device transmit failed");
                Err(self.drop_frame(vif, tx_drop_reason(&e)))
            }
        }
    }
}
