//! Label reinjection.
//!
//! A coalesced frame leaves the GRO poller with the 4-byte label header at
//! its MAC header offset and `data` at the inner network header. The label
//! selects the next-hop the forwarding engine already chose before GRO, so
//! the frame goes straight back to `nh_output` with flow processing skipped.

use std::sync::Arc;

use crate::engine::ForwardingEngine;
use crate::error::DropReason;
use crate::frame::Frame;
use crate::interface::Interface;
use crate::packet::{Packet, PacketFlags};
use crate::router::{NextHop, Router, label_from_header};

/// Label stored at the frame's MAC header.
pub fn frame_label(frame: &Frame) -> Result<u32, DropReason> {
    let mac = frame.mac_header().ok_or(DropReason::InvalidPacket)?;
    let word = frame.read_u32_abs(mac).ok_or(DropReason::InvalidPacket)?;
    Ok(label_from_header(word))
}

/// Resolve a frame's label to its next-hop and the virtual interface
/// behind it.
pub fn resolve_label(frame: &Frame, router: &Router) -> Result<(Arc<NextHop>, Arc<Interface>), DropReason> {
    let label = frame_label(frame)?;
    let nh = router.lookup_label(label)?;
    let vif = match nh.vif() {
        Some(vif) if vif.is_virtual() => Arc::clone(vif),
        _ => return Err(DropReason::Misc),
    };
    Ok((nh, vif))
}

/// Hand a coalesced frame back to the forwarding engine.
///
/// The resulting packet belongs to the next-hop's interface, has its
/// network and inner network headers at `data` and is marked flow-set.
/// `nh_output` is called exactly once on success and never on failure.
pub fn reinject(
    engine: &dyn ForwardingEngine,
    cpu: usize,
    frame: Frame,
    router: &Router,
) -> Result<(), DropReason> {
    let (nh, vif) = resolve_label(&frame, router)?;
    let mut packet = Packet::from_frame(frame, &vif, cpu)?;

    let data = packet.data_offset();
    packet.set_network_header(data);
    packet.set_inner_network_header(data);
    packet.flags.insert(PacketFlags::FLOW_SET);

    engine.nh_output(vif.vrf(), packet, &nh);
    Ok(())
}
