//! Receive entry points and the datapath handle.
//!
//! [`Datapath`] ties the pieces together: the ingress handler host devices
//! call for every received frame, the three receive-steering points, GRO
//! enqueue and polling, host-stack delivery and the forwarding engine's
//! transmit entry. One instance is shared by all cores; per-core state
//! lives in [`crate::runtime::CoreWorker`].
//!
//! Steering points, in order of precedence:
//!
//! - ingress: frames from physical interfaces move to another core before
//!   the forwarding engine sees them;
//! - post-forward: frames bound for a GRO queue move to another core before
//!   they are queued (only when ingress steering is off);
//! - GRO stage: the frame records the receive queue its coalesced result is
//!   reinjected on.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use crossbeam_channel::Receiver;
use tracing::{debug, info, trace, warn};

use crate::config::DatapathConfig;
use crate::engine::ForwardingEngine;
use crate::error::{DatapathError, DropReason, Result};
use crate::frame::{ETH_HLEN, Frame, IPPROTO_TCP, IPPROTO_UDP, TCP_CSUM_OFFSET, UDP_CSUM_OFFSET};
use crate::gro::{GroMerger, Passthrough, PollOutcome};
use crate::gso::Segmenter;
use crate::interface::{HostDevice, Interface};
use crate::packet::{Packet, PacketFlags};
use crate::reinject::{reinject, resolve_label};
use crate::router::{LABEL_HDR_LEN, RouterRegistry};
use crate::rps::{CpuTopology, SteerMeta, flow_hash, steer_target};
use crate::runtime::{CoreMessage, Mailboxes};
use crate::stats::DropStats;
use crate::transmit::{Transmitter, tx_drop_reason};

/// Builder for creating a Datapath
pub struct DatapathBuilder {
    engine: Arc<dyn ForwardingEngine>,
    config: DatapathConfig,
    topology: Option<CpuTopology>,
    routers: Option<Arc<RouterRegistry>>,
    segmenter: Option<Box<dyn Segmenter>>,
}

impl DatapathBuilder {
    pub fn new(engine: Arc<dyn ForwardingEngine>) -> Self {
        Self {
            engine,
            config: DatapathConfig::default(),
            topology: None,
            routers: None,
            segmenter: None,
        }
    }

    pub fn config(mut self, config: DatapathConfig) -> Self {
        self.config = config;
        self
    }

    /// CPU topology; detected from sysfs when not given.
    pub fn topology(mut self, topology: CpuTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn routers(mut self, routers: Arc<RouterRegistry>) -> Self {
        self.routers = Some(routers);
        self
    }

    /// Host segmentation facility; software segmentation when not given.
    pub fn segmenter(mut self, segmenter: Box<dyn Segmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    /// Build the datapath and one inbox per core. Each inbox is meant for a
    /// [`crate::runtime::CoreWorker`].
    pub fn build(self) -> Result<(Arc<Datapath>, Vec<Receiver<CoreMessage>>)> {
        let topology = match self.topology {
            Some(topology) => topology,
            None => CpuTopology::detect()?,
        };
        self.config.validate_for_cores(topology.num_cores())?;

        let drops = Arc::new(DropStats::new());
        let tx = match self.segmenter {
            Some(segmenter) => Transmitter::with_segmenter(Arc::clone(&drops), segmenter),
            None => Transmitter::new(Arc::clone(&drops)),
        };
        let (mailboxes, inboxes) = Mailboxes::new(topology.num_cores(), self.config.core_backlog);

        info!(
            cores = topology.num_cores(),
            nodes = topology.num_nodes(),
            ingress = self.config.steering.ingress.enabled,
            post_forward = self.config.steering.post_forward.enabled,
            gro = self.config.steering.gro.enabled,
            "Datapath created"
        );

        let datapath = Datapath {
            config: ArcSwap::from_pointee(self.config),
            topology,
            routers: self.routers.unwrap_or_default(),
            engine: self.engine,
            drops,
            tx,
            mailboxes,
        };
        Ok((Arc::new(datapath), inboxes))
    }
}

/// Shared datapath state.
pub struct Datapath {
    config: ArcSwap<DatapathConfig>,
    topology: CpuTopology,
    routers: Arc<RouterRegistry>,
    engine: Arc<dyn ForwardingEngine>,
    drops: Arc<DropStats>,
    tx: Transmitter,
    mailboxes: Mailboxes,
}

impl Datapath {
    pub fn builder(engine: Arc<dyn ForwardingEngine>) -> DatapathBuilder {
        DatapathBuilder::new(engine)
    }

    pub fn config(&self) -> Guard<Arc<DatapathConfig>> {
        self.config.load()
    }

    /// Replace the configuration. Takes effect for the next frame on every
    /// core; frames already steered under the old one are handled by the
    /// stale-message rules.
    pub fn set_config(&self, config: DatapathConfig) -> Result<()> {
        config.validate_for_cores(self.topology.num_cores())?;
        info!(?config, "Datapath configuration updated");
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    pub fn routers(&self) -> &Arc<RouterRegistry> {
        &self.routers
    }

    pub fn drops(&self) -> &Arc<DropStats> {
        &self.drops
    }

    pub fn transmitter(&self) -> &Transmitter {
        &self.tx
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    fn drop_frame(&self, reason: DropReason) {
        self.drops.record(reason);
    }

    fn drop_on(&self, vif: &Interface, reason: DropReason) {
        self.drops.record(reason);
        trace!(vif = %vif, reason = %reason, "Dropped frame");
    }

    /// Count a drop on `vif` and hand the reason back to the caller.
    fn refuse(&self, vif: &Interface, reason: DropReason) -> std::result::Result<(), DropReason> {
        self.drop_on(vif, reason);
        Err(reason)
    }

    /// Hand a host device to an interface. Virtual interfaces start
    /// accepting GRO input.
    pub fn attach(&self, vif: &Arc<Interface>, device: Box<dyn HostDevice>) -> Result<()> {
        let name = device.name().to_string();
        if !vif.install_device(device) {
            return Err(DatapathError::AlreadyAttached(vif.idx()));
        }
        if let Some(gro) = vif.gro() {
            gro.enable();
        }
        info!(vif = %vif, device = %name, mtu = vif.mtu(), "Attached host device");
        Ok(())
    }

    /// Release an interface's host device. Frames still queued for GRO are
    /// purged and counted as `InterfaceDown`.
    pub fn detach(&self, vif: &Arc<Interface>) -> Result<()> {
        let Some(device) = vif.take_device() else {
            return Err(DatapathError::NotAttached(vif.idx()));
        };
        if let Some(gro) = vif.gro() {
            let purged = gro.disable();
            self.drops.record_n(DropReason::InterfaceDown, purged as u64);
            if purged > 0 {
                debug!(vif = %vif, purged, "Purged GRO queue");
            }
        }
        info!(vif = %vif, device = device.name(), "Detached host device");
        Ok(())
    }

    /// Entry point for a frame received on `vif`, data at the Ethernet
    /// header.
    pub fn rx_handler(&self, cpu: usize, vif: &Arc<Interface>, mut frame: Frame) {
        let config = self.config.load();
        let point = &config.steering.ingress;
        if point.enabled && vif.is_physical() {
            let hash = flow_hash(&mut frame);
            let target = steer_target(point, hash, cpu, None, &self.topology);
            if target != cpu {
                frame.last_core = Some(cpu);
                let meta = SteerMeta {
                    flow_hash: hash,
                    source_vif: Some(vif.idx()),
                    source_rid: vif.rid(),
                    prior_core: cpu,
                };
                trace!(vif = %vif, from = cpu, to = target, "Steering at ingress");
                if let Err(reason) = self.mailboxes.send(target, CoreMessage::Ingress { frame, meta }) {
                    self.drop_on(vif, reason);
                }
                return;
            }
        }
        self.deliver(cpu, vif, frame);
    }

    /// Frame steered at ingress, arriving on its new core.
    pub fn handle_ingress(&self, cpu: usize, frame: Frame, meta: SteerMeta) {
        if !self.config.load().steering.ingress.enabled {
            trace!(cpu, from = meta.prior_core, "Stale ingress-steered frame");
            return self.drop_frame(DropReason::Misc);
        }
        let vif = self
            .routers
            .get(meta.source_rid)
            .zip(meta.source_vif)
            .and_then(|(router, idx)| router.interface(idx))
            .filter(|vif| vif.is_physical() && vif.has_device());
        match vif {
            Some(vif) => self.deliver(cpu, &vif, frame),
            None => {
                trace!(rid = meta.source_rid, vif = ?meta.source_vif, "Steered frame lost its interface");
                self.drop_frame(DropReason::Misc);
            }
        }
    }

    fn deliver(&self, cpu: usize, vif: &Arc<Interface>, mut frame: Frame) {
        vif.counters().record_rx(frame.len());
        let vlan = frame.vlan_tci.take().map(|tci| tci & 0x0fff);
        match Packet::from_frame(frame, vif, cpu) {
            Ok(packet) => self.engine.vif_rx(vif, packet, vlan),
            Err(reason) => self.drop_on(vif, reason),
        }
    }

    /// Forwarding-engine transmit entry.
    ///
    /// GRO-flagged packets for a virtual interface carry a 4-byte label
    /// header right in front of `data`; it becomes the MAC header, `data`
    /// moves to the network header and the frame is queued for GRO instead
    /// of being sent.
    ///
    /// `Ok` means the packet was handed to the device, a GRO queue or another
    /// core. Every `Err` has already been counted in the drop statistics.
    pub fn if_tx(&self, vif: &Arc<Interface>, packet: Packet) -> std::result::Result<(), DropReason> {
        let cpu = packet.cpu();
        let (mut frame, meta) = packet.into_frame();
        if !vif.has_device() {
            return self.refuse(vif, DropReason::InterfaceDown);
        }

        if meta.flags.contains(PacketFlags::GRO) && vif.is_virtual() {
            if !frame.push(LABEL_HDR_LEN) {
                return self.refuse(vif, DropReason::NoMemory);
            }
            frame.reset_mac_header();
            let pulled = (meta.network_h as usize)
                .checked_sub(frame.data_offset())
                .is_some_and(|n| frame.pull(n));
            if !pulled {
                return self.refuse(vif, DropReason::InvalidPacket);
            }
            frame.reset_network_header();
            return self.enqueue_for_gro(cpu, vif, frame, false);
        }

        self.tx.send(vif, frame, meta)
    }

    /// Deliver a forwarding-engine packet to the host stack through `vif`'s
    /// device.
    ///
    /// Mirrored packets with a partial checksum get their TCP/UDP checksum
    /// field zeroed. The frame reaches the device with its MAC header set
    /// and `data` at the network header.
    pub fn if_rx(&self, vif: &Interface, packet: Packet) -> std::result::Result<(), DropReason> {
        let mirrored = packet.flags.contains(PacketFlags::FROM_DP | PacketFlags::CSUM_PARTIAL);
        let net = packet.network_header() as usize;
        let (mut frame, _) = packet.into_frame();
        let Some(device) = vif.device() else {
            self.drop_on(vif, DropReason::InterfaceDown);
            return Err(DropReason::InterfaceDown);
        };
        vif.counters().record_rx(frame.len());

        if mirrored && let (Some(vhl), Some(proto)) = (frame.byte_at(net), frame.byte_at(net + 9)) {
            let l4 = net + ((vhl & 0x0f) as usize) * 4;
            let field = match proto {
                IPPROTO_TCP => Some(l4 + TCP_CSUM_OFFSET),
                IPPROTO_UDP => Some(l4 + UDP_CSUM_OFFSET),
                _ => None,
            };
            if let Some(field) = field {
                frame.write_u16(field, 0);
            }
        }

        frame.reset_mac_header();
        if let Some(ethertype) = frame.read_u16(frame.data_offset() + 12) {
            frame.protocol = ethertype;
        }
        if frame.pull(ETH_HLEN) {
            frame.reset_network_header();
        }

        device.netif_rx(frame).map_err(|e| {
            debug!(vif = %vif, error = %e, "Host stack delivery failed");
            let reason = tx_drop_reason(&e);
            self.drop_on(vif, reason);
            reason
        })
    }

    /// Queue a frame on a virtual interface's GRO input.
    ///
    /// `steered` is set for frames that already took the post-forward hop.
    pub fn enqueue_for_gro(
        &self,
        cpu: usize,
        vif: &Arc<Interface>,
        mut frame: Frame,
        steered: bool,
    ) -> std::result::Result<(), DropReason> {
        let config = self.config.load();
        let steering = &config.steering;

        if steering.post_forward.enabled && !steering.ingress.enabled && !steered {
            let hash = flow_hash(&mut frame);
            let target = steer_target(&steering.post_forward, hash, cpu, None, &self.topology);
            if target != cpu {
                frame.last_core = Some(cpu);
                let meta = SteerMeta {
                    flow_hash: hash,
                    source_vif: None,
                    source_rid: vif.rid(),
                    prior_core: cpu,
                };
                trace!(vif = %vif, from = cpu, to = target, "Steering before GRO");
                return match self
                    .mailboxes
                    .send(target, CoreMessage::PostForward { frame, meta })
                {
                    Ok(()) => Ok(()),
                    Err(reason) => self.refuse(vif, reason),
                };
            }
        }

        let Some(gro) = vif.gro() else {
            return self.refuse(vif, DropReason::InvalidIf);
        };

        frame.rx_queue = if steering.gro.enabled {
            let previous = if steering.post_forward.enabled || steering.ingress.enabled {
                frame.last_core
            } else {
                None
            };
            let hash = flow_hash(&mut frame);
            Some(steer_target(&steering.gro, hash, cpu, previous, &self.topology))
        } else {
            None
        };

        match gro.enqueue(frame) {
            Ok(enqueued) => {
                if enqueued.evicted {
                    self.drop_on(vif, DropReason::QueueFull);
                }
                if enqueued.schedule {
                    self.schedule_poll(cpu, vif);
                }
                Ok(())
            }
            Err(reason) => self.refuse(vif, reason),
        }
    }

    /// Frame steered before GRO, arriving on its new core. The label is
    /// resolved again to find the GRO queue.
    pub fn handle_post_forward(&self, cpu: usize, frame: Frame, meta: SteerMeta) {
        if self.config.load().steering.ingress.enabled || meta.source_vif.is_some() {
            trace!(cpu, from = meta.prior_core, "Stale post-forward-steered frame");
            return self.drop_frame(DropReason::Misc);
        }
        let Some(router) = self.routers.get(meta.source_rid) else {
            return self.drop_frame(DropReason::Misc);
        };
        match resolve_label(&frame, &router) {
            Ok((_, vif)) => {
                let _ = self.enqueue_for_gro(cpu, &vif, frame, true);
            }
            Err(reason) => {
                trace!(cpu, reason = %reason, "Post-forward label lookup failed");
                self.drop_frame(reason);
            }
        }
    }

    /// Arrange for exactly one poll of `vif`'s GRO queue on `cpu`. If the
    /// core's inbox is full the queue is drained right here, uncoalesced.
    fn schedule_poll(&self, cpu: usize, vif: &Arc<Interface>) {
        if self.mailboxes.send(cpu, CoreMessage::Poll(Arc::clone(vif))).is_ok() {
            return;
        }
        warn!(vif = %vif, cpu, "Core backlog full, polling GRO queue inline");
        let mut merger = Passthrough;
        while self.drain_gro(cpu, vif, &mut merger).status.needs_repoll() {}
    }

    /// Poll `vif`'s GRO queue once and schedule the next poll if work is
    /// left.
    pub fn poll_gro(&self, cpu: usize, vif: &Arc<Interface>, merger: &mut dyn GroMerger) -> PollOutcome {
        let outcome = self.drain_gro(cpu, vif, merger);
        if outcome.status.needs_repoll() {
            self.schedule_poll(cpu, vif);
        }
        outcome
    }

    fn drain_gro(&self, cpu: usize, vif: &Arc<Interface>, merger: &mut dyn GroMerger) -> PollOutcome {
        let Some(gro) = vif.gro() else {
            return PollOutcome::default();
        };
        let budget = self.config.load().gro.poll_budget;
        let mut coalesced = Vec::new();
        let outcome = gro.poll(budget, merger, &mut coalesced);
        trace!(vif = %vif, processed = outcome.processed, out = coalesced.len(), status = ?outcome.status, "GRO poll");
        if outcome.purged > 0 {
            self.drops.record_n(DropReason::InterfaceDown, outcome.purged as u64);
            debug!(vif = %vif, purged = outcome.purged, "Purged GRO queue");
        }

        for frame in coalesced {
            match frame.rx_queue {
                Some(queue) if queue != cpu => {
                    if let Err(reason) = self
                        .mailboxes
                        .send(queue, CoreMessage::Reinject { frame, rid: vif.rid() })
                    {
                        self.drop_on(vif, reason);
                    }
                }
                _ => self.reinject_local(cpu, frame, vif.rid()),
            }
        }
        outcome
    }

    /// Reinject a coalesced frame on this core.
    pub fn reinject_local(&self, cpu: usize, frame: Frame, rid: u16) {
        let Some(router) = self.routers.get(rid) else {
            trace!(rid, "Reinjection for unknown router");
            return self.drop_frame(DropReason::Misc);
        };
        if let Err(reason) = reinject(self.engine.as_ref(), cpu, frame, &router) {
            trace!(rid, cpu, reason = %reason, "Reinjection failed");
            self.drop_frame(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::error::TxError;
    use crate::interface::VifType;
    use crate::router::{NextHop, Router};

    #[derive(Default)]
    struct Engine {
        rx: Mutex<Vec<(u32, Option<u16>, usize)>>,
    }

    impl ForwardingEngine for Engine {
        fn vif_rx(&self, vif: &Arc<Interface>, packet: Packet, vlan: Option<u16>) {
            self.rx.lock().unwrap().push((vif.idx(), vlan, packet.cpu()));
        }

        fn nh_output(&self, _vrf: u16, _packet: Packet, _nh: &Arc<NextHop>) {}
    }

    struct Sink {
        delivered: Arc<Mutex<Vec<Frame>>>,
    }

    impl HostDevice for Sink {
        fn name(&self) -> &str {
            "sink0"
        }

        fn mtu(&self) -> usize {
            1500
        }

        fn queue_xmit(&self, _frame: Frame) -> std::result::Result<(), TxError> {
            Ok(())
        }

        fn netif_rx(&self, frame: Frame) -> std::result::Result<(), TxError> {
            self.delivered.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn datapath(engine: Arc<Engine>) -> Arc<Datapath> {
        let (dp, _inboxes) = Datapath::builder(engine)
            .topology(CpuTopology::uniform(4, 1, 1))
            .build()
            .unwrap();
        dp
    }

    #[test]
    fn test_rx_without_steering_delivers_inline() {
        let engine = Arc::new(Engine::default());
        let dp = datapath(Arc::clone(&engine));
        let vif = Interface::builder(1, VifType::Physical).build();

        let mut frame = Frame::from_wire(&[0u8; 60]);
        frame.vlan_tci = Some(0x2064);
        dp.rx_handler(2, &vif, frame);

        let rx = engine.rx.lock().unwrap();
        assert_eq!(rx.as_slice(), &[(1, Some(0x064), 2)]);
        assert_eq!(vif.counters().snapshot().rx_packets, 1);
    }

    #[test]
    fn test_attach_detach() {
        let dp = datapath(Arc::new(Engine::default()));
        let vif = Interface::builder(1, VifType::Virtual).build();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        dp.attach(&vif, Box::new(Sink { delivered: Arc::clone(&delivered) }))
            .unwrap();
        assert!(matches!(
            dp.attach(&vif, Box::new(Sink { delivered })),
            Err(DatapathError::AlreadyAttached(1))
        ));
        dp.detach(&vif).unwrap();
        assert!(matches!(dp.detach(&vif), Err(DatapathError::NotAttached(1))));
    }

    #[test]
    fn test_if_rx_zeroes_mirrored_checksum() {
        let dp = datapath(Arc::new(Engine::default()));
        let vif = Interface::builder(1, VifType::Virtual).build();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        dp.attach(&vif, Box::new(Sink { delivered: Arc::clone(&delivered) }))
            .unwrap();

        let mut bytes = vec![0u8; 14 + 20 + 8 + 4];
        bytes[12] = 0x08;
        bytes[14] = 0x45;
        bytes[14 + 9] = IPPROTO_UDP;
        bytes[14 + 20 + 6] = 0xab;
        bytes[14 + 20 + 7] = 0xcd;
        let frame = Frame::from_wire(&bytes);
        let net = (frame.data_offset() + ETH_HLEN) as u16;
        let mut packet = Packet::from_frame(frame, &vif, 0).unwrap();
        packet.flags.insert(PacketFlags::FROM_DP | PacketFlags::CSUM_PARTIAL);
        packet.set_network_header(net);

        dp.if_rx(&vif, packet).unwrap();
        let delivered = delivered.lock().unwrap();
        let frame = &delivered[0];
        assert_eq!(frame.protocol, 0x0800);
        assert_eq!(frame.data()[20 + 6..20 + 8], [0, 0]);
        assert_eq!(vif.counters().snapshot().rx_packets, 1);
    }

    #[test]
    fn test_stale_steered_messages_dropped() {
        let dp = datapath(Arc::new(Engine::default()));
        let meta = SteerMeta {
            flow_hash: 1,
            source_vif: Some(1),
            source_rid: 0,
            prior_core: 0,
        };
        dp.handle_ingress(1, Frame::from_wire(&[0u8; 60]), meta);
        dp.handle_post_forward(1, Frame::from_wire(&[0u8; 60]), meta);
        assert_eq!(dp.drops().get(DropReason::Misc), 2);
    }

    #[test]
    fn test_gro_enqueue_on_non_virtual_dropped() {
        let dp = datapath(Arc::new(Engine::default()));
        let routers = dp.routers();
        routers.insert(Arc::new(Router::new(0, 4, 4)));
        let vif = Interface::builder(1, VifType::Physical).build();
        let result = dp.enqueue_for_gro(0, &vif, Frame::from_wire(&[0u8; 60]), false);
        assert_eq!(result, Err(DropReason::InvalidIf));
        assert_eq!(dp.drops().get(DropReason::InvalidIf), 1);
    }
}
