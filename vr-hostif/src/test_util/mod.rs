//! Test utilities
//!
//! Host devices and forwarding engines that record what the datapath does
//! with them, plus packet builders. Used by the integration tests and by
//! the `selftest` command.

pub mod packets;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::trace;

use crate::engine::ForwardingEngine;
use crate::error::TxError;
use crate::frame::{ETH_HLEN, ETH_P_IP, Frame, IPPROTO_UDP, IPV4_MIN_HLEN, UDP_HLEN};
use crate::interface::{HostDevice, Interface};
use crate::packet::{Packet, PacketFlags, PacketType};
use crate::receive::Datapath;
use crate::router::{LABEL_HDR_LEN, NextHop, label_from_header};

use packets::MPLS_UDP_PORT;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host device that keeps every frame it is given.
///
/// Clones share their recordings, so a clone can be attached while the
/// original is kept for inspection.
#[derive(Clone)]
pub struct RecordingDevice {
    name: String,
    mtu: usize,
    hard_header_len: usize,
    fail_after: Option<usize>,
    sent: Arc<Mutex<Vec<Frame>>>,
    delivered: Arc<Mutex<Vec<Frame>>>,
}

impl RecordingDevice {
    pub fn new(name: &str, mtu: usize) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            hard_header_len: ETH_HLEN,
            fail_after: None,
            sent: Arc::new(Mutex::new(Vec::new())),
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reject transmits once `n` frames have been sent.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Frames queued for transmission.
    pub fn sent(&self) -> Vec<Frame> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }

    /// Frames delivered to the host stack.
    pub fn delivered(&self) -> Vec<Frame> {
        lock(&self.delivered).clone()
    }
}

impl HostDevice for RecordingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn hard_header_len(&self) -> usize {
        self.hard_header_len
    }

    fn queue_xmit(&self, frame: Frame) -> Result<(), TxError> {
        let mut sent = lock(&self.sent);
        if self.fail_after.is_some_and(|n| sent.len() >= n) {
            return Err(TxError::QueueFull);
        }
        sent.push(frame);
        Ok(())
    }

    fn netif_rx(&self, frame: Frame) -> Result<(), TxError> {
        lock(&self.delivered).push(frame);
        Ok(())
    }
}

/// A packet the engine received from an interface.
pub struct Received {
    pub vif: u32,
    pub vlan: Option<u16>,
    pub cpu: usize,
    pub packet: Packet,
}

/// A packet reinjected towards a next-hop.
pub struct Output {
    pub vrf: u16,
    pub nh: u32,
    pub cpu: usize,
    pub packet: Packet,
}

/// Forwarding engine that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingEngine {
    received: Mutex<Vec<Received>>,
    output: Mutex<Vec<Output>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_received(&self) -> Vec<Received> {
        std::mem::take(&mut *lock(&self.received))
    }

    pub fn take_output(&self) -> Vec<Output> {
        std::mem::take(&mut *lock(&self.output))
    }

    pub fn received_count(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn output_count(&self) -> usize {
        lock(&self.output).len()
    }
}

impl ForwardingEngine for RecordingEngine {
    fn vif_rx(&self, vif: &Arc<Interface>, packet: Packet, vlan: Option<u16>) {
        let cpu = packet.cpu();
        lock(&self.received).push(Received {
            vif: vif.idx(),
            vlan,
            cpu,
            packet,
        });
    }

    fn nh_output(&self, vrf: u16, packet: Packet, nh: &Arc<NextHop>) {
        let cpu = packet.cpu();
        lock(&self.output).push(Output {
            vrf,
            nh: nh.id(),
            cpu,
            packet,
        });
    }
}

/// Counters kept by [`TunnelEngine`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelCounts {
    /// Tunneled frames decapsulated and sent towards GRO.
    pub decapsulated: u64,
    /// Frames the engine could not handle.
    pub rejected: u64,
    /// Coalesced packets handed back through `nh_output`.
    pub reinjected: u64,
    /// Wire segments those packets stand for.
    pub segments: u64,
}

/// Minimal MPLS-over-UDP forwarding engine.
///
/// Tunneled frames from any interface are decapsulated, their label is
/// resolved in the interface's router and the inner packet is sent to the
/// next-hop's interface through GRO. Reinjected packets are transmitted on
/// the next-hop's interface.
#[derive(Default)]
pub struct TunnelEngine {
    datapath: OnceLock<Weak<Datapath>>,
    decapsulated: AtomicU64,
    rejected: AtomicU64,
    reinjected: AtomicU64,
    segments: AtomicU64,
}

impl TunnelEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect the engine to the datapath it forwards through.
    pub fn bind(&self, datapath: &Arc<Datapath>) {
        let _ = self.datapath.set(Arc::downgrade(datapath));
    }

    fn datapath(&self) -> Option<Arc<Datapath>> {
        self.datapath.get().and_then(Weak::upgrade)
    }

    pub fn counts(&self) -> TunnelCounts {
        TunnelCounts {
            decapsulated: self.decapsulated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            reinjected: self.reinjected.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, vif: &Interface, why: &'static str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        trace!(vif = %vif, why, "Tunnel engine rejected packet");
    }

    /// Label of a tunneled frame, if it is MPLS over UDP.
    fn tunnel_label(data: &[u8]) -> Option<u32> {
        let ip = ETH_HLEN;
        let udp = ip + IPV4_MIN_HLEN;
        let label = udp + UDP_HLEN;
        if data.len() < label + LABEL_HDR_LEN + IPV4_MIN_HLEN {
            return None;
        }
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        let dport = u16::from_be_bytes([data[udp + 2], data[udp + 3]]);
        if ethertype != ETH_P_IP || data[ip] != 0x45 || data[ip + 9] != IPPROTO_UDP || dport != MPLS_UDP_PORT {
            return None;
        }
        let word = u32::from_be_bytes([data[label], data[label + 1], data[label + 2], data[label + 3]]);
        Some(label_from_header(word))
    }
}

impl ForwardingEngine for TunnelEngine {
    fn vif_rx(&self, vif: &Arc<Interface>, mut packet: Packet, _vlan: Option<u16>) {
        let Some(dp) = self.datapath() else {
            return self.reject(vif, "unbound");
        };
        let Some(label) = Self::tunnel_label(packet.data()) else {
            return self.reject(vif, "not tunneled");
        };
        let target = dp
            .routers()
            .get(vif.rid())
            .and_then(|router| router.lookup_label(label).ok())
            .and_then(|nh| nh.vif().cloned());
        let Some(target) = target else {
            return self.reject(vif, "no next-hop");
        };

        if !packet.pull(ETH_HLEN + IPV4_MIN_HLEN + UDP_HLEN + LABEL_HDR_LEN) {
            return self.reject(vif, "truncated");
        }
        let net = packet.data_offset();
        packet.set_network_header(net);
        packet.set_inner_network_header(net);
        packet.ptype = PacketType::Ip;
        packet.flags.insert(PacketFlags::GRO);

        self.decapsulated.fetch_add(1, Ordering::Relaxed);
        if let Err(reason) = dp.if_tx(&target, packet) {
            trace!(vif = %target, reason = %reason, "GRO handoff refused");
        }
    }

    fn nh_output(&self, _vrf: u16, packet: Packet, nh: &Arc<NextHop>) {
        let segs = packet
            .frame()
            .gso
            .map_or(1, |gso| u64::from(gso.segs.max(1)));
        self.reinjected.fetch_add(1, Ordering::Relaxed);
        self.segments.fetch_add(segs, Ordering::Relaxed);

        if let (Some(vif), Some(dp)) = (nh.vif(), self.datapath()) {
            if let Err(reason) = dp.if_tx(vif, packet) {
                trace!(vif = %vif, reason = %reason, "Reinjected packet refused");
            }
        }
    }
}
