//! The forwarding engine seam.
//!
//! Routing decisions live outside this crate. The datapath hands adapted
//! packets to a [`ForwardingEngine`] and receives packets back through
//! [`crate::receive::Datapath::if_tx`] and [`crate::receive::Datapath::if_rx`].

use std::sync::Arc;

use crate::interface::Interface;
use crate::packet::Packet;
use crate::router::NextHop;

/// Software forwarding engine.
pub trait ForwardingEngine: Send + Sync {
    /// A packet received on `vif`. `vlan` is the 12-bit VLAN id, if tagged.
    fn vif_rx(&self, vif: &Arc<Interface>, packet: Packet, vlan: Option<u16>);

    /// Forward a reinjected packet to a resolved next-hop in `vrf`.
    fn nh_output(&self, vrf: u16, packet: Packet, nh: &Arc<NextHop>);
}
