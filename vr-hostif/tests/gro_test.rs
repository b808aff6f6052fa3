//! GRO queue and label reinjection integration tests

mod harness;

use std::sync::Arc;

use harness::{EMPTY_LABEL, Fixture, LABEL, NH_ID, steering};
use vr_hostif::checksum::ipv4_transport_checksum_valid;
use vr_hostif::config::{DatapathConfig, OverflowPolicy, SteeringPoint};
use vr_hostif::frame::{Frame, GsoKind};
use vr_hostif::test_util::packets::{TCP_ACK, TCP_FIN, mpls_over_udp, tcp_segment};
use vr_hostif::test_util::{Output, RecordingDevice, RecordingEngine};
use vr_hostif::{DropReason, PacketFlags};

const MSS: usize = 1000;

fn segment(flow: u16, n: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..MSS).map(|i| (i + n) as u8).collect();
    tcp_segment(40_000 + flow, 80, 1 + (n * MSS) as u32, 1, TCP_ACK, &payload)
}

fn fixture(config: DatapathConfig) -> (Fixture, Arc<RecordingEngine>) {
    let engine = RecordingEngine::new();
    (Fixture::builder().config(config).build(engine.clone()), engine)
}

fn send_segments(fixture: &Fixture, cpu: usize, flow: u16, range: std::ops::Range<usize>) {
    for n in range {
        let packet = fixture.gro_packet(cpu, LABEL, &segment(flow, n));
        let _ = fixture.dp.if_tx(&fixture.virt, packet);
    }
}

fn segs(output: &Output) -> u16 {
    output.packet.frame().gso.map_or(1, |gso| gso.segs)
}

#[test]
fn test_segments_coalesced_and_reinjected() {
    let (mut fixture, engine) = fixture(DatapathConfig::default());

    send_segments(&fixture, 0, 1, 0..4);
    assert_eq!(engine.output_count(), 0);
    assert_eq!(fixture.virt.gro().unwrap().len(), 4);

    fixture.run();
    let output = engine.take_output();
    assert_eq!(output.len(), 1);

    let out = &output[0];
    assert_eq!(out.nh, NH_ID);
    assert_eq!(out.vrf, fixture.virt.vrf());
    assert_eq!(out.cpu, 0);
    assert_eq!(out.packet.vif().idx(), fixture.virt.idx());
    assert!(out.packet.flags.contains(PacketFlags::FLOW_SET));
    assert_eq!(out.packet.network_header(), out.packet.data_offset());
    assert_eq!(out.packet.inner_network_header(), out.packet.data_offset());
    assert_eq!(out.packet.len(), 40 + 4 * MSS);
    assert!(ipv4_transport_checksum_valid(out.packet.data()));

    let gso = out.packet.frame().gso.unwrap();
    assert_eq!(gso.kind, GsoKind::TcpV4);
    assert_eq!(gso.size as usize, MSS);
    assert_eq!(gso.segs, 4);
    assert!(fixture.virt.gro().unwrap().is_empty());
}

#[test]
fn test_flows_are_not_merged_together() {
    let (mut fixture, engine) = fixture(DatapathConfig::default());

    for n in 0..2 {
        send_segments(&fixture, 0, 1, n..n + 1);
        send_segments(&fixture, 0, 2, n..n + 1);
    }
    fixture.run();

    let output = engine.take_output();
    assert_eq!(output.len(), 2);
    assert!(output.iter().all(|o| segs(o) == 2));
}

#[test]
fn test_fin_is_not_merged() {
    let (mut fixture, engine) = fixture(DatapathConfig::default());

    send_segments(&fixture, 0, 1, 0..2);
    let fin = tcp_segment(40_001, 80, 1 + (2 * MSS) as u32, 1, TCP_ACK | TCP_FIN, &[]);
    fixture.dp.if_tx(&fixture.virt, fixture.gro_packet(0, LABEL, &fin)).unwrap();
    fixture.run();

    let output = engine.take_output();
    assert_eq!(output.len(), 2);
    assert_eq!(segs(&output[0]), 2);
    assert_eq!(output[1].packet.len(), 40);
}

#[test]
fn test_gro_steering_reinjects_on_receive_queue_core() {
    let config = steering(SteeringPoint::disabled(), SteeringPoint::disabled(), SteeringPoint::fixed(3));
    let (mut fixture, engine) = fixture(config);

    send_segments(&fixture, 0, 1, 0..3);
    assert_eq!(fixture.run_core(0), 1);
    assert_eq!(engine.output_count(), 0);

    assert_eq!(fixture.run_core(3), 1);
    let output = engine.take_output();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].cpu, 3);
    assert_eq!(segs(&output[0]), 3);
}

#[test]
fn test_queue_overflow_drops_newest() {
    let mut config = DatapathConfig::default();
    config.gro.queue_limit = 2;
    let (mut fixture, engine) = fixture(config);

    send_segments(&fixture, 0, 1, 0..2);
    let packet = fixture.gro_packet(0, LABEL, &segment(1, 2));
    assert_eq!(fixture.dp.if_tx(&fixture.virt, packet), Err(DropReason::QueueFull));
    assert_eq!(fixture.dp.drops().get(DropReason::QueueFull), 1);

    fixture.run();
    let output = engine.take_output();
    assert_eq!(output.len(), 1);
    assert_eq!(segs(&output[0]), 2);
}

#[test]
fn test_queue_overflow_drops_oldest() {
    let mut config = DatapathConfig::default();
    config.gro.queue_limit = 2;
    config.gro.overflow = OverflowPolicy::DropOldest;
    let (mut fixture, engine) = fixture(config);

    send_segments(&fixture, 0, 1, 0..3);
    assert_eq!(fixture.dp.drops().get(DropReason::QueueFull), 1);

    fixture.run();
    let output = engine.take_output();
    assert_eq!(output.len(), 1);
    assert_eq!(segs(&output[0]), 2);
    // The survivors start at the second segment.
    let data = output[0].packet.data();
    let seq = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);
    assert_eq!(seq, 1 + MSS as u32);
}

#[test]
fn test_poll_budget_spreads_work_over_polls() {
    let mut config = DatapathConfig::default();
    config.gro.poll_budget = 2;
    let (mut fixture, engine) = fixture(config);

    send_segments(&fixture, 0, 1, 0..5);
    assert_eq!(fixture.run(), 3);

    let output = engine.take_output();
    assert_eq!(output.len(), 3);
    assert_eq!(output.iter().map(segs).sum::<u16>(), 5);
}

#[test]
fn test_small_segments_fill_aggregates_within_buffer_limit() {
    let mut config = DatapathConfig::default();
    config.gro.poll_budget = 1024;
    let (mut fixture, engine) = fixture(config);

    let payload = [0x5a; 100];
    for n in 0..700u32 {
        let seg = tcp_segment(40_001, 80, 1 + n * 100, 1, TCP_ACK, &payload);
        fixture.dp.if_tx(&fixture.virt, fixture.gro_packet(0, LABEL, &seg)).unwrap();
    }
    assert_eq!(fixture.virt.gro().unwrap().len(), 700);
    fixture.run();

    let output = engine.take_output();
    assert_eq!(fixture.dp.drops().total(), 0);
    assert_eq!(output.len(), 2);
    assert_eq!(output.iter().map(segs).sum::<u16>(), 700);
    for out in &output {
        assert!(out.packet.frame().end_offset() <= u16::MAX as usize);
        assert!(ipv4_transport_checksum_valid(out.packet.data()));
    }
}

#[test]
fn test_unresolvable_labels_are_dropped_at_reinjection() {
    let (mut fixture, engine) = fixture(DatapathConfig::default());

    let seg = segment(1, 0);
    fixture.dp.if_tx(&fixture.virt, fixture.gro_packet(0, EMPTY_LABEL, &seg)).unwrap();
    fixture.dp.if_tx(&fixture.virt, fixture.gro_packet(0, 1000, &seg)).unwrap();
    fixture.run();

    assert_eq!(engine.output_count(), 0);
    assert_eq!(fixture.dp.drops().get(DropReason::InvalidNexthop), 1);
    assert_eq!(fixture.dp.drops().get(DropReason::InvalidLabel), 1);
}

#[test]
fn test_detach_purges_gro_queue() {
    let (mut fixture, engine) = fixture(DatapathConfig::default());

    send_segments(&fixture, 0, 1, 0..3);
    fixture.dp.detach(&fixture.virt).unwrap();
    assert_eq!(fixture.dp.drops().get(DropReason::InterfaceDown), 3);

    fixture.run();
    assert_eq!(engine.output_count(), 0);

    // Detached: the transmit entry refuses the packet outright.
    let packet = fixture.gro_packet(0, LABEL, &segment(1, 3));
    assert_eq!(fixture.dp.if_tx(&fixture.virt, packet), Err(DropReason::InterfaceDown));
    assert_eq!(fixture.dp.drops().get(DropReason::InterfaceDown), 4);

    fixture
        .dp
        .attach(&fixture.virt, Box::new(RecordingDevice::new("tap1", 1500)))
        .unwrap();
    send_segments(&fixture, 0, 1, 4..6);
    fixture.run();
    let output = engine.take_output();
    assert_eq!(output.len(), 1);
    assert_eq!(segs(&output[0]), 2);
}

#[test]
fn test_tunnel_traffic_end_to_end() {
    let (mut fixture, engine) = Fixture::tunnel(DatapathConfig::default());

    for n in 0..4 {
        let frame = Frame::from_wire(&mpls_over_udp(LABEL, &segment(1, n)));
        fixture.dp.rx_handler(0, &fixture.phys, frame);
    }
    fixture.run();

    let counts = engine.counts();
    assert_eq!(counts.decapsulated, 4);
    assert_eq!(counts.rejected, 0);
    assert_eq!(counts.reinjected, 1);
    assert_eq!(counts.segments, 4);

    let sent = fixture.tap.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 40 + 4 * MSS);
    assert_eq!(fixture.dp.drops().total(), 0);
}
