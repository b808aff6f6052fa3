use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vr_hostif::config::{DEFAULT_MAX_INTERFACES, DEFAULT_MAX_LABELS, SteeringPoint};
use vr_hostif::frame::{ETH_HLEN, Frame};
use vr_hostif::router::{NextHop, Router};
use vr_hostif::rps::{CpuTopology, hash_3words};
use vr_hostif::runtime::spawn_workers;
use vr_hostif::test_util::packets::{TCP_ACK, TUNNEL_HDR_LEN, mpls_over_udp, tcp_segment, tunneled_frame, tunneled_udp};
use vr_hostif::test_util::{RecordingDevice, TunnelEngine};
use vr_hostif::{Datapath, DatapathConfig, Interface, Packet, PacketType, VifType};

/// Label the self-test routes to the virtual interface.
const SELFTEST_LABEL: u32 = 16;

/// TCP payload per received segment.
const SEGMENT_PAYLOAD: usize = 1000;

/// Wire size of the oversized tunneled frames sent in the transmit phase.
const OVERSIZED_LEN: usize = 1600;

#[derive(Parser)]
#[command(name = "vr-hostif")]
#[command(about = "vRouter host-interface datapath", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the CPU topology receive steering works with
    Topology,

    /// Validate a datapath configuration file
    CheckConfig {
        /// Path to the JSON configuration
        path: PathBuf,
    },

    /// Push tunneled traffic through an in-process datapath
    Selftest {
        /// JSON configuration (defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of simulated cores
        #[arg(long, default_value = "4")]
        cores: usize,

        /// TCP flows received on the physical interface
        #[arg(long, default_value = "8")]
        flows: usize,

        /// Segments per flow
        #[arg(long, default_value = "16")]
        segments: usize,

        /// Oversized tunneled frames transmitted on the physical interface
        #[arg(long, default_value = "8")]
        frames: usize,

        /// Enable hashed ingress and GRO-stage steering
        #[arg(long)]
        steer: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vr_hostif=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Topology => show_topology(),
        Commands::CheckConfig { path } => {
            let config = DatapathConfig::load(&path)
                .with_context(|| format!("Invalid configuration {}", path.display()))?;
            let topology = CpuTopology::detect()?;
            config.validate_for_cores(topology.num_cores())?;
            println!("{}: ok", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Selftest {
            config,
            cores,
            flows,
            segments,
            frames,
            steer,
        } => {
            let mut config = match config {
                Some(path) => DatapathConfig::load(&path)
                    .with_context(|| format!("Invalid configuration {}", path.display()))?,
                None => DatapathConfig::default(),
            };
            if steer {
                config.steering.ingress = SteeringPoint::hashed();
                config.steering.gro = SteeringPoint::hashed();
            }
            run_selftest(config, cores, flows, segments, frames)
        }
    }
}

fn show_topology() -> anyhow::Result<()> {
    let topology = CpuTopology::detect().context("Failed to read CPU topology")?;
    println!("cores: {}", topology.num_cores());
    println!("nodes: {}", topology.num_nodes());
    for node in 0..topology.num_nodes() {
        if let Some(mask) = topology.node_mask(node) {
            println!("  node {node}: {mask:?}");
        }
    }
    for core in 0..topology.num_cores() {
        if let Some(siblings) = topology.siblings(core) {
            println!("  core {core}: siblings {siblings:?}");
        }
    }
    Ok(())
}

fn run_selftest(
    config: DatapathConfig,
    cores: usize,
    flows: usize,
    segments: usize,
    frames: usize,
) -> anyhow::Result<()> {
    info!(cores, flows, segments, frames, "Starting self-test");

    let engine = TunnelEngine::new();
    let (dp, inboxes) = Datapath::builder(engine.clone())
        .config(config.clone())
        .topology(CpuTopology::uniform(cores, 1, 1))
        .build()?;
    engine.bind(&dp);

    let router = Arc::new(Router::new(0, DEFAULT_MAX_INTERFACES, DEFAULT_MAX_LABELS));
    dp.routers().insert(Arc::clone(&router));

    let phys = Interface::builder(0, VifType::Physical).name("eth0").build();
    let virt = Interface::builder(1, VifType::Virtual)
        .name("tap0")
        .gro(config.gro)
        .build();
    router.add_interface(Arc::clone(&phys))?;
    router.add_interface(Arc::clone(&virt))?;
    router.set_label(SELFTEST_LABEL, Some(NextHop::new(1, Some(Arc::clone(&virt)))))?;

    let wire = RecordingDevice::new("eth0", 1500);
    let tap = RecordingDevice::new("tap0", 1500);
    dp.attach(&phys, Box::new(wire.clone()))?;
    dp.attach(&virt, Box::new(tap.clone()))?;

    let workers = spawn_workers(&dp, inboxes, config.pin_cores)?;

    // Receive: tunneled TCP flows arrive on core 0 and are coalesced on
    // their way to the tap.
    let payload = vec![0x5a; SEGMENT_PAYLOAD];
    for seg in 0..segments {
        for flow in 0..flows {
            let seq = (seg * SEGMENT_PAYLOAD) as u32;
            let inner = tcp_segment(40_000 + flow as u16, 80, seq, 1, TCP_ACK, &payload);
            let mut frame = Frame::from_wire(&mpls_over_udp(SELFTEST_LABEL, &inner));
            frame.rx_hash = hash_3words(flow as u32, SELFTEST_LABEL, 0, 0) | 1;
            dp.rx_handler(0, &phys, frame);
        }
    }

    let expected = (flows * segments) as u64;
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.counts().segments + dp.drops().total() < expected {
        if Instant::now() > deadline {
            warn!(expected, counts = ?engine.counts(), "Timed out waiting for reinjection");
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    // Transmit: oversized tunneled UDP leaves the physical interface as
    // fragments.
    for ident in 0..frames {
        let frame = tunneled_frame(&tunneled_udp(SELFTEST_LABEL, OVERSIZED_LEN, ident as u16));
        let data = frame.data_offset();
        let mut packet = Packet::from_frame(frame, &phys, 0)?;
        packet.set_network_header((data + ETH_HLEN) as u16);
        packet.set_inner_network_header((data + TUNNEL_HDR_LEN) as u16);
        packet.ptype = PacketType::IpOverIp;
        if let Err(reason) = dp.if_tx(&phys, packet) {
            warn!(ident, reason = %reason, "Selftest packet refused");
        }
    }

    dp.mailboxes().shutdown();
    for worker in workers {
        worker.join().map_err(anyhow::Error::msg)?;
    }

    let counts = engine.counts();
    let phys_stats = phys.counters().snapshot();
    let virt_stats = virt.counters().snapshot();
    info!(
        received = expected,
        decapsulated = counts.decapsulated,
        rejected = counts.rejected,
        reinjected = counts.reinjected,
        coalesced_segments = counts.segments,
        tap_frames = tap.sent_count(),
        "Receive phase done"
    );
    info!(
        sent = frames,
        wire_frames = wire.sent_count(),
        phys_tx = phys_stats.tx_packets,
        phys_rx = phys_stats.rx_packets,
        virt_tx = virt_stats.tx_packets,
        "Transmit phase done"
    );
    for (reason, count) in dp.drops().snapshot() {
        warn!(reason = reason.as_str(), count, "Drops");
    }

    println!(
        "rx: {} segments -> {} packets on {}, tx: {} frames -> {} wire frames, drops: {}",
        expected,
        counts.reinjected,
        virt.name(),
        frames,
        wire.sent_count(),
        dp.drops().total()
    );
    Ok(())
}
