//! Test harness for datapath integration tests
//!
//! Builds a datapath with one router holding a physical and a virtual
//! interface, both backed by recording devices. Core workers are driven
//! from the test thread, so every test is deterministic.

#![allow(dead_code)]

use std::sync::Arc;

use vr_hostif::config::{DatapathConfig, SteeringPoint};
use vr_hostif::frame::{ETH_HLEN, Frame};
use vr_hostif::gso::Segmenter;
use vr_hostif::router::{LABEL_HDR_LEN, NextHop, Router, label_header};
use vr_hostif::rps::CpuTopology;
use vr_hostif::runtime::CoreWorker;
use vr_hostif::test_util::packets::TUNNEL_HDR_LEN;
use vr_hostif::test_util::{RecordingDevice, RecordingEngine, TunnelEngine};
use vr_hostif::{Datapath, ForwardingEngine, Interface, Packet, PacketFlags, PacketType, VifType};

/// Label routed to the virtual interface.
pub const LABEL: u32 = 16;

/// Next-hop id behind [`LABEL`].
pub const NH_ID: u32 = 7;

/// Label present in the table with no next-hop behind it.
pub const EMPTY_LABEL: u32 = 17;

pub const WIRE_MTU: usize = 1500;

pub struct Fixture {
    pub dp: Arc<Datapath>,
    pub router: Arc<Router>,
    pub phys: Arc<Interface>,
    pub virt: Arc<Interface>,
    pub wire: RecordingDevice,
    pub tap: RecordingDevice,
    pub workers: Vec<CoreWorker>,
}

/// Fixture options
pub struct FixtureBuilder {
    config: DatapathConfig,
    cores: usize,
    wire: RecordingDevice,
    segmenter: Option<Box<dyn Segmenter>>,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            config: DatapathConfig::default(),
            cores: 4,
            wire: RecordingDevice::new("eth0", WIRE_MTU),
            segmenter: None,
        }
    }

    pub fn config(mut self, config: DatapathConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn wire(mut self, wire: RecordingDevice) -> Self {
        self.wire = wire;
        self
    }

    pub fn segmenter(mut self, segmenter: Box<dyn Segmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn build(self, engine: Arc<dyn ForwardingEngine>) -> Fixture {
        let mut builder = Datapath::builder(engine)
            .config(self.config.clone())
            .topology(CpuTopology::uniform(self.cores, 1, 1));
        if let Some(segmenter) = self.segmenter {
            builder = builder.segmenter(segmenter);
        }
        let (dp, inboxes) = builder.build().expect("Failed to build datapath");

        let router = Arc::new(Router::new(0, 8, 64));
        dp.routers().insert(Arc::clone(&router));

        let phys = Interface::builder(0, VifType::Physical).name("eth0").build();
        let virt = Interface::builder(1, VifType::Virtual)
            .vrf(3)
            .name("tap0")
            .gro(self.config.gro)
            .build();
        router.add_interface(Arc::clone(&phys)).unwrap();
        router.add_interface(Arc::clone(&virt)).unwrap();
        router
            .set_label(LABEL, Some(NextHop::new(NH_ID, Some(Arc::clone(&virt)))))
            .unwrap();

        let tap = RecordingDevice::new("tap0", WIRE_MTU);
        dp.attach(&phys, Box::new(self.wire.clone())).unwrap();
        dp.attach(&virt, Box::new(tap.clone())).unwrap();

        let workers = inboxes
            .into_iter()
            .enumerate()
            .map(|(core, inbox)| CoreWorker::new(core, inbox, Arc::clone(&dp)))
            .collect();

        Fixture {
            dp,
            router,
            phys,
            virt,
            wire: self.wire,
            tap,
            workers,
        }
    }
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::new()
    }

    /// Default fixture with a recording engine.
    pub fn recording() -> (Self, Arc<RecordingEngine>) {
        let engine = RecordingEngine::new();
        (Self::builder().build(engine.clone()), engine)
    }

    /// Default fixture with the tunnel engine bound to it.
    pub fn tunnel(config: DatapathConfig) -> (Self, Arc<TunnelEngine>) {
        let engine = TunnelEngine::new();
        let fixture = Self::builder().config(config).build(engine.clone());
        engine.bind(&fixture.dp);
        (fixture, engine)
    }

    /// Run every core's inbox until all are empty. Returns the number of
    /// messages handled.
    pub fn run(&mut self) -> usize {
        let mut total = 0;
        loop {
            let handled: usize = self.workers.iter_mut().map(CoreWorker::run_pending).sum();
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    /// Run a single core's inbox.
    pub fn run_core(&mut self, core: usize) -> usize {
        self.workers[core].run_pending()
    }

    /// Forwarding-engine packet bound for the virtual interface's GRO queue:
    /// `inner` at `data` with the label header right in front of it.
    pub fn gro_packet(&self, cpu: usize, label: u32, inner: &[u8]) -> Packet {
        let headroom = 32;
        let mut frame = Frame::with_headroom(headroom, inner);
        let at = headroom - LABEL_HDR_LEN;
        frame.buffer_mut()[at..headroom].copy_from_slice(&label_header(label).to_be_bytes());

        let mut packet = Packet::from_frame(frame, &self.virt, cpu).unwrap();
        packet.set_network_header(headroom as u16);
        packet.set_inner_network_header(headroom as u16);
        packet.ptype = PacketType::Ip;
        packet.flags.insert(PacketFlags::GRO);
        packet
    }

    /// Forwarding-engine packet carrying a tunneled frame out of the physical
    /// interface.
    pub fn tunnel_packet(&self, frame: Frame) -> Packet {
        let data = frame.data_offset();
        let mut packet = Packet::from_frame(frame, &self.phys, 0).unwrap();
        packet.set_network_header((data + ETH_HLEN) as u16);
        packet.set_inner_network_header((data + TUNNEL_HDR_LEN) as u16);
        packet.ptype = PacketType::IpOverIp;
        packet
    }
}

/// Configuration with the given steering points.
pub fn steering(ingress: SteeringPoint, post_forward: SteeringPoint, gro: SteeringPoint) -> DatapathConfig {
    let mut config = DatapathConfig::default();
    config.steering.ingress = ingress;
    config.steering.post_forward = post_forward;
    config.steering.gro = gro;
    config
}
