//! Receive steering integration tests
//!
//! Frames enter through the receive handler or the GRO-bound transmit path
//! and are followed across cores by running each core's inbox.

mod harness;

use std::collections::HashMap;

use harness::{Fixture, LABEL, steering};
use vr_hostif::config::{DatapathConfig, SteeringPoint};
use vr_hostif::frame::Frame;
use vr_hostif::rps::hash_3words;
use vr_hostif::test_util::RecordingEngine;
use vr_hostif::test_util::packets::{TCP_ACK, mpls_over_udp, tcp_segment};
use vr_hostif::DropReason;

fn wire_frame(flow: u16) -> Frame {
    let inner = tcp_segment(40_000 + flow, 80, 1, 1, TCP_ACK, &[0xab; 200]);
    Frame::from_wire(&mpls_over_udp(LABEL, &inner))
}

fn fixture(config: DatapathConfig) -> (Fixture, std::sync::Arc<RecordingEngine>) {
    let engine = RecordingEngine::new();
    (Fixture::builder().config(config).build(engine.clone()), engine)
}

#[test]
fn test_ingress_steering_to_fixed_core() {
    let config = steering(SteeringPoint::fixed(2), SteeringPoint::disabled(), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    fixture.dp.rx_handler(0, &fixture.phys, wire_frame(1));
    assert_eq!(engine.received_count(), 0);

    assert_eq!(fixture.run(), 1);
    let received = engine.take_received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].vif, 0);
    assert_eq!(received[0].cpu, 2);
    assert_eq!(fixture.phys.counters().snapshot().rx_packets, 1);
}

#[test]
fn test_ingress_steering_to_current_core_is_inline() {
    let config = steering(SteeringPoint::fixed(0), SteeringPoint::disabled(), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    fixture.dp.rx_handler(0, &fixture.phys, wire_frame(1));
    assert_eq!(engine.received_count(), 1);
    assert_eq!(fixture.run(), 0);
}

#[test]
fn test_virtual_interfaces_are_not_steered_at_ingress() {
    let config = steering(SteeringPoint::fixed(2), SteeringPoint::disabled(), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    fixture.dp.rx_handler(1, &fixture.virt, wire_frame(1));
    let received = engine.take_received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].cpu, 1);
    assert_eq!(received[0].vif, 1);
    assert_eq!(fixture.run(), 0);
}

#[test]
fn test_hashed_ingress_steering_keeps_flows_together() {
    let config = steering(SteeringPoint::hashed(), SteeringPoint::disabled(), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    for round in 0..2 {
        for flow in 0..32u16 {
            let mut frame = wire_frame(flow);
            frame.rx_hash = hash_3words(flow as u32, 0, 0, 0) | 1;
            fixture.dp.rx_handler(0, &fixture.phys, frame);
        }
        assert_eq!(fixture.run(), 32, "round {round}");
    }

    let mut core_of: HashMap<u16, usize> = HashMap::new();
    for received in engine.take_received() {
        assert_ne!(received.cpu, 0);
        let data = received.packet.data();
        // Source port of the inner TCP header.
        let port = u16::from_be_bytes([data[66], data[67]]) - 40_000;
        let core = *core_of.entry(port).or_insert(received.cpu);
        assert_eq!(core, received.cpu);
    }
    assert_eq!(core_of.len(), 32);
}

#[test]
fn test_vlan_id_is_passed_to_engine() {
    let (fixture, engine) = fixture(DatapathConfig::default());

    let mut frame = wire_frame(1);
    frame.vlan_tci = Some(0xa005);
    fixture.dp.rx_handler(0, &fixture.phys, frame);
    fixture.dp.rx_handler(0, &fixture.phys, wire_frame(2));

    let received = engine.take_received();
    assert_eq!(received[0].vlan, Some(5));
    assert_eq!(received[1].vlan, None);
    assert!(received[0].packet.frame().vlan_tci.is_none());
}

#[test]
fn test_stale_ingress_steering_is_dropped() {
    let config = steering(SteeringPoint::fixed(2), SteeringPoint::disabled(), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    fixture.dp.rx_handler(0, &fixture.phys, wire_frame(1));
    fixture.dp.set_config(DatapathConfig::default()).unwrap();
    fixture.run();

    assert_eq!(engine.received_count(), 0);
    assert_eq!(fixture.dp.drops().get(DropReason::Misc), 1);
}

#[test]
fn test_steered_frame_whose_interface_detached() {
    let config = steering(SteeringPoint::fixed(3), SteeringPoint::disabled(), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    fixture.dp.rx_handler(0, &fixture.phys, wire_frame(1));
    fixture.dp.detach(&fixture.phys).unwrap();
    fixture.run();

    assert_eq!(engine.received_count(), 0);
    assert_eq!(fixture.dp.drops().get(DropReason::Misc), 1);
}

#[test]
fn test_ingress_backlog_full() {
    let mut config = steering(SteeringPoint::fixed(1), SteeringPoint::disabled(), SteeringPoint::disabled());
    config.core_backlog = 2;
    let (mut fixture, engine) = fixture(config);

    for flow in 0..5 {
        fixture.dp.rx_handler(0, &fixture.phys, wire_frame(flow));
    }
    assert_eq!(fixture.dp.drops().get(DropReason::BacklogFull), 3);
    fixture.run();
    assert_eq!(engine.received_count(), 2);
}

#[test]
fn test_post_forward_steering_moves_gro_enqueue() {
    let config = steering(SteeringPoint::disabled(), SteeringPoint::fixed(1), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    let inner = tcp_segment(40_000, 80, 1, 1, TCP_ACK, &[1u8; 100]);
    let packet = fixture.gro_packet(0, LABEL, &inner);
    fixture.dp.if_tx(&fixture.virt, packet).unwrap();
    assert!(fixture.virt.gro().unwrap().is_empty());

    fixture.run();
    let output = engine.take_output();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].cpu, 1);
}

#[test]
fn test_post_forward_steering_yields_to_ingress_steering() {
    let config = steering(SteeringPoint::fixed(2), SteeringPoint::fixed(1), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    let inner = tcp_segment(40_000, 80, 1, 1, TCP_ACK, &[1u8; 100]);
    let packet = fixture.gro_packet(0, LABEL, &inner);
    fixture.dp.if_tx(&fixture.virt, packet).unwrap();
    assert_eq!(fixture.virt.gro().unwrap().len(), 1);

    fixture.run();
    let output = engine.take_output();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].cpu, 0);
}

#[test]
fn test_stale_post_forward_steering_is_dropped() {
    let config = steering(SteeringPoint::disabled(), SteeringPoint::fixed(1), SteeringPoint::disabled());
    let (mut fixture, engine) = fixture(config);

    let inner = tcp_segment(40_000, 80, 1, 1, TCP_ACK, &[1u8; 100]);
    let packet = fixture.gro_packet(0, LABEL, &inner);
    fixture.dp.if_tx(&fixture.virt, packet).unwrap();

    let enabled = steering(SteeringPoint::fixed(2), SteeringPoint::fixed(1), SteeringPoint::disabled());
    fixture.dp.set_config(enabled).unwrap();
    fixture.run();

    assert_eq!(engine.output_count(), 0);
    assert_eq!(fixture.dp.drops().get(DropReason::Misc), 1);
}
