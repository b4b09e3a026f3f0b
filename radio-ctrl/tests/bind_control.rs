//! Two nodes on the same channel: pairing, authorization and the behavior
//! of the delivery engine when nobody answers.

mod common;

use std::time::Duration;

use common::{expect_silence, next_event, node_with, start_poll};
use radio_ctrl::ctrl::message::{ControlMessage, ControlValue};
use radio_ctrl::ctrl::{attribute, BindEntry, BindError, CtrlEvent, NodeConfig};
use radio_ctrl::device::frame::{FrameHeader, FrameKind, Packet};
use radio_ctrl::device::loopback::LoopbackBus;
use radio_ctrl::device::transport::Transport;
use radio_ctrl::ctrl::initiator::CHANNEL_HINT_KEY;
use radio_ctrl::storage::Storage;
use radio_ctrl::ADDR_BROADCAST;

const RESPONDER: [u8; 6] = [0x10, 0x11, 0x12, 0x13, 0x14, 0x15];
const INITIATOR: [u8; 6] = [0x20, 0x21, 0x22, 0x23, 0x24, 0x25];

#[test]
fn bind_then_control_then_unbind() {
    let bus = LoopbackBus::new();
    let responder = node_with(bus.endpoint(RESPONDER), NodeConfig::default());
    let initiator = node_with(bus.endpoint(INITIATOR), NodeConfig::default());
    let _rp = start_poll(&responder.node);
    let _ip = start_poll(&initiator.node);

    responder
        .node
        .start_binding(Duration::from_secs(30), -55, None);

    let sender = initiator.node.initiator();
    sender.bind(attribute::KEY_1, true).expect("bind delivery");

    match next_event(&responder.events) {
        Some(CtrlEvent::Bound(entry)) => {
            assert_eq!(entry.addr, INITIATOR);
            assert_eq!(entry.initiator_attribute, attribute::KEY_1);
        }
        other => panic!("expected Bound, got {:?}", other),
    }
    assert_eq!(responder.node.list_bindings(8).len(), 1);

    sender
        .send_control(attribute::KEY_1, attribute::BRIGHTNESS, ControlValue::Int(1))
        .expect("control delivery");

    match next_event(&responder.events) {
        Some(CtrlEvent::ControlReceived { src, message }) => {
            assert_eq!(src, INITIATOR);
            assert_eq!(message.initiator_attribute, attribute::KEY_1);
            assert_eq!(message.responder_attribute, attribute::BRIGHTNESS);
            assert_eq!(message.value.as_i32(), 1);
        }
        other => panic!("expected ControlReceived, got {:?}", other),
    }

    sender.bind(attribute::KEY_1, false).expect("unbind delivery");
    match next_event(&responder.events) {
        Some(CtrlEvent::Unbound(entry)) => assert_eq!(entry.addr, INITIATOR),
        other => panic!("expected Unbound, got {:?}", other),
    }
    assert!(responder.node.list_bindings(8).is_empty());
}

#[test]
fn weak_signal_is_rejected_not_bound() {
    let bus = LoopbackBus::new();
    let responder = node_with(bus.endpoint(RESPONDER), NodeConfig::default());
    let initiator = node_with(bus.endpoint(INITIATOR), NodeConfig::default());
    bus.set_rssi(&RESPONDER, -80);
    let _rp = start_poll(&responder.node);
    let _ip = start_poll(&initiator.node);

    responder
        .node
        .start_binding(Duration::from_secs(30), -55, None);

    // Delivery itself succeeds: acknowledgments are a transport concern and
    // go out before the bind policy says no.
    initiator
        .node
        .initiator()
        .bind(attribute::KEY_1, true)
        .expect("bind delivery");

    assert!(matches!(
        next_event(&responder.events),
        Some(CtrlEvent::BindRejected(BindError::RssiTooLow))
    ));
    expect_silence(&responder.events);
    assert!(responder.node.list_bindings(8).is_empty());
}

#[test]
fn late_request_is_rejected_with_timeout() {
    let bus = LoopbackBus::new();
    let responder = node_with(bus.endpoint(RESPONDER), NodeConfig::default());
    let initiator = node_with(bus.endpoint(INITIATOR), NodeConfig::default());
    let _rp = start_poll(&responder.node);
    let _ip = start_poll(&initiator.node);

    responder.node.start_binding(Duration::ZERO, -55, None);
    std::thread::sleep(Duration::from_millis(20));

    initiator
        .node
        .initiator()
        .bind(attribute::KEY_1, true)
        .expect("bind delivery");

    assert!(matches!(
        next_event(&responder.events),
        Some(CtrlEvent::BindRejected(BindError::Timeout))
    ));
    assert!(responder.node.list_bindings(8).is_empty());
}

#[test]
fn unbound_sender_never_reaches_the_application() {
    let bus = LoopbackBus::new();
    let responder = node_with(bus.endpoint(RESPONDER), NodeConfig::default());
    let initiator = node_with(bus.endpoint(INITIATOR), NodeConfig::default());
    let _rp = start_poll(&responder.node);
    let _ip = start_poll(&initiator.node);

    initiator
        .node
        .initiator()
        .send_control(attribute::KEY_1, attribute::POWER, ControlValue::Bool(true))
        .expect("control delivery");

    expect_silence(&responder.events);
}

#[test]
fn retry_budget_is_bounded_when_nobody_answers() {
    let bus = LoopbackBus::new();
    let domain = vec![1, 2, 3];
    let radio = bus.endpoint_with_domain(INITIATOR, domain.clone());
    let config = NodeConfig {
        send_retry_num: 2,
        ..NodeConfig::default()
    };
    let initiator = node_with(radio, config);
    let _ip = start_poll(&initiator.node);

    let result = initiator.node.initiator().bind(attribute::KEY_1, true);
    assert!(result.is_err());
    // No more than retry budget times the number of channels searched.
    assert_eq!(bus.tx_count(), 2 * domain.len());
}

#[test]
fn acknowledged_channel_becomes_the_next_hint() {
    let bus = LoopbackBus::new();
    let responder_radio = bus.endpoint_with_domain(RESPONDER, vec![1, 2, 6]);
    responder_radio.set_channel(6).unwrap();
    let responder = node_with(responder_radio, NodeConfig::default());
    let initiator = node_with(
        bus.endpoint_with_domain(INITIATOR, vec![1, 2, 6]),
        NodeConfig::default(),
    );
    let _rp = start_poll(&responder.node);
    let _ip = start_poll(&initiator.node);

    responder
        .node
        .start_binding(Duration::from_secs(30), -55, None);

    initiator
        .node
        .initiator()
        .bind(attribute::KEY_1, true)
        .expect("bind delivery after channel search");

    assert!(matches!(
        next_event(&responder.events),
        Some(CtrlEvent::Bound(_))
    ));
    assert_eq!(
        initiator.storage.get(CHANNEL_HINT_KEY).unwrap(),
        Some(vec![6])
    );
}

#[test]
fn retransmitted_frames_are_delivered_once() {
    let bus = LoopbackBus::new();
    let responder = node_with(bus.endpoint(RESPONDER), NodeConfig::default());
    responder
        .node
        .add_binding(BindEntry {
            addr: INITIATOR,
            initiator_attribute: attribute::KEY_1,
        })
        .unwrap();

    // A bare radio standing in for a chatty initiator that repeats itself.
    let raw = bus.endpoint(INITIATOR);
    let message = ControlMessage::new(attribute::KEY_1, attribute::POWER, ControlValue::Int(7));
    let packet = Packet {
        kind: FrameKind::ControlData,
        header: FrameHeader {
            magic: 0x4242,
            ..FrameHeader::default()
        },
        dest: ADDR_BROADCAST,
        src: INITIATOR,
        payload: message.to_bytes().unwrap(),
    };
    let bytes = packet.to_bytes().unwrap();
    for _ in 0..3 {
        raw.send(&ADDR_BROADCAST, &bytes, Duration::from_millis(10))
            .unwrap();
    }

    let _rp = start_poll(&responder.node);
    assert!(matches!(
        next_event(&responder.events),
        Some(CtrlEvent::ControlReceived { .. })
    ));
    expect_silence(&responder.events);
}

#[test]
fn group_frames_require_membership() {
    let bus = LoopbackBus::new();
    let responder = node_with(bus.endpoint(RESPONDER), NodeConfig::default());
    responder
        .node
        .add_binding(BindEntry {
            addr: INITIATOR,
            initiator_attribute: attribute::KEY_1,
        })
        .unwrap();
    let group = [b'G', b'R', b'P', 0, 0, 1];
    responder.node.join_group(group);

    let raw = bus.endpoint(INITIATOR);
    let message = ControlMessage::new(attribute::KEY_1, attribute::POWER, ControlValue::Int(1));
    let mut packet = Packet {
        kind: FrameKind::ControlData,
        header: FrameHeader {
            magic: 0x1001,
            group: true,
            ..FrameHeader::default()
        },
        dest: group,
        src: INITIATOR,
        payload: message.to_bytes().unwrap(),
    };
    let _rp = start_poll(&responder.node);

    raw.send(&ADDR_BROADCAST, &packet.to_bytes().unwrap(), Duration::from_millis(10))
        .unwrap();
    assert!(matches!(
        next_event(&responder.events),
        Some(CtrlEvent::ControlReceived { .. })
    ));

    // Same frame towards a group we never joined.
    packet.dest = [b'G', b'R', b'P', 0, 0, 2];
    packet.header.magic = 0x1002;
    raw.send(&ADDR_BROADCAST, &packet.to_bytes().unwrap(), Duration::from_millis(10))
        .unwrap();
    expect_silence(&responder.events);
}
