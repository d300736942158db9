//! Reference behaviours of the aggregation and block-ack engine, driven through the public API.

use bytes::Bytes;
use dot11n_conformance::{ChannelModel, LinkSimulator, NODE_A, NODE_B};
use dot11n_core::{Dot11nConfig, MacAddr, SimTime, Tid};
use dot11n_mac::block_ack::apply_block_ack;
use dot11n_mac::buffer::OutputBuffer;
use dot11n_mac::management::{build_action, BlockAckAction, Delba, DelbaReason};
use dot11n_mac::testing::ScriptedErrors;
use dot11n_mac::{BaaState, FlowKey, FrameKind, FrameState, MacFrame, SeqNum, TxStatus, TxUnit};

fn tid() -> Tid {
    Tid::from_priority(0)
}

fn toward_b() -> FlowKey {
    FlowKey::new(NODE_B, tid())
}

#[test]
fn two_small_msdus_become_one_amsdu() {
    let config = Dot11nConfig { enable_amsdu: true, ..Dot11nConfig::default() };
    let mut sim = LinkSimulator::infrastructure(config, Dot11nConfig::default(), ChannelModel::default()).unwrap();
    sim.push(0, tid(), vec![1u8; 200]);
    sim.push(0, tid(), vec![2u8; 200]);
    sim.mac_mut(0).classify_packets(SimTime::ZERO);

    let mac = sim.mac(0);
    let flow = mac.output_flow(&toward_b()).unwrap();
    assert_eq!(flow.num_packets(), 1);
    let amsdu = flow.front().unwrap();
    assert!(amsdu.is_amsdu);
    assert!(amsdu.payload_len() > 400);
    assert_eq!(mac.staging_flow(&toward_b()).map_or(0, |f| f.num_packets()), 0);
    assert_eq!(mac.stats().amsdus_created, 1);
}

#[test]
fn partial_block_ack_releases_only_the_prefix() {
    let key = FlowKey::new(MacAddr::from_node(9), tid());
    let mut buf = OutputBuffer::new();
    buf.get_or_create(key, SimTime::ZERO).seed_sequence(SeqNum::new(10));
    for _ in 0..4 {
        let frame = MacFrame::qos_data(key.peer, NODE_A, tid(), Bytes::from_static(b"data"), SimTime::ZERO);
        buf.enqueue(key, frame, SimTime::ZERO);
    }
    let flow = buf.get_mut(&key).unwrap();
    for frame in flow.frames_mut() {
        frame.state = FrameState::AwaitingAck;
    }
    flow.win_starts = Some(SeqNum::new(10));
    flow.win_sizes = 4;

    let update = apply_block_ack(flow, SeqNum::new(10), 0b0101).unwrap();
    assert_eq!(update.freed.len(), 1);
    assert_eq!(update.retained_acked, 1);
    assert_eq!(flow.win_starts, Some(SeqNum::new(11)));
    assert_eq!(flow.win_sizes, 3);
    let states: Vec<_> = flow.frames().map(|f| (f.seq.unwrap().value(), f.state)).collect();
    assert_eq!(
        states,
        vec![(11, FrameState::AwaitingAck), (12, FrameState::Acked), (13, FrameState::AwaitingAck)]
    );
    flow.assert_consistent();
}

#[test]
fn unanswered_frame_is_dropped_at_the_retry_limit() {
    let config = Dot11nConfig { short_retry_limit: 4, ..Dot11nConfig::default() };
    let mut sim = LinkSimulator::infrastructure(config, Dot11nConfig::default(), ChannelModel::lossy(1.0, 3)).unwrap();
    sim.push(0, tid(), vec![0u8; 100]);
    sim.run_until_idle(1_000).unwrap();

    let data_attempts = sim.air_log().iter().filter(|r| r.from == 0 && r.kind == FrameKind::QosData).count();
    assert_eq!(data_attempts, 4);
    assert_eq!(sim.mac(0).stats().pkts_dropped_dcf, 1);
    assert_eq!(sim.mac(0).network().dropped.len(), 1);
    assert_eq!(sim.mac(0).queued_frames(), 0);
    assert_eq!(sim.delivered(1), 0);
}

#[test]
fn corrupted_subframe_is_recovered_in_order() {
    let config = Dot11nConfig { enable_ampdu: true, ..Dot11nConfig::default() };
    let mut sim = LinkSimulator::infrastructure(config.clone(), config, ChannelModel::default())
        .unwrap()
        .with_subframe_errors(ScriptedErrors::new([1]));
    for i in 0..3u8 {
        sim.push(0, tid(), vec![i; 120]);
    }
    sim.run_until_idle(1_000).unwrap();

    let ampdus: Vec<_> = sim
        .air_log()
        .iter()
        .filter(|r| r.from == 0 && r.kind == FrameKind::QosData)
        .map(|r| r.subframes)
        .collect();
    assert_eq!(ampdus.first(), Some(&3));
    assert_eq!(sim.mac(1).stats().subframes_corrupted, 1);
    assert!(sim.mac(0).stats().retransmissions >= 1);

    let delivered: Vec<u8> = sim.mac(1).network().delivered.iter().map(|(p, _)| p[0]).collect();
    assert_eq!(delivered, vec![0, 1, 2]);
    assert_eq!(sim.mac(0).stats().pkts_sent_unicast, 3);
}

#[test]
fn recipient_delba_purges_every_queued_frame() {
    let config = Dot11nConfig { enable_data_bursting: true, ..Dot11nConfig::default() };
    let mut sim = LinkSimulator::infrastructure(config.clone(), config, ChannelModel::default()).unwrap();
    for i in 0..7u8 {
        sim.push(0, tid(), vec![i; 80]);
    }

    let mut guard = 0;
    while sim.mac(0).agreement(&toward_b()).map(|a| a.state()) != Some(BaaState::Idle) {
        assert!(sim.step().unwrap(), "link went idle before the agreement was set up");
        guard += 1;
        assert!(guard < 100);
    }
    assert_eq!(sim.delivered(1), 1);

    // two burst frames leave without reaching the peer
    let now = sim.now();
    let mac = sim.mac_mut(0);
    for _ in 0..2 {
        let tx = mac.contend(now).unwrap().unwrap();
        assert!(matches!(tx.unit, TxUnit::Mpdu(_)));
        mac.on_tx_status(now, TxStatus::Sent);
    }
    let flow = mac.output_flow(&toward_b()).unwrap();
    assert_eq!(flow.frames().filter(|f| f.state == FrameState::AwaitingAck).count(), 2);
    assert_eq!(flow.num_packets(), 6);

    let delba = BlockAckAction::Delba(Delba { tid: tid(), initiator: false, reason: DelbaReason::EndBa });
    let frame = MacFrame::new(FrameKind::Action, NODE_A, NODE_B, build_action(&delba), now);
    assert_eq!(mac.receive_frame(now, frame).map(|f| f.kind), Some(FrameKind::Ack));

    let flow = mac.output_flow(&toward_b()).unwrap();
    assert_eq!(flow.num_packets(), 0);
    assert_eq!((flow.win_starts, flow.win_sizes), (None, 0));
    assert_eq!(mac.agreement(&toward_b()).unwrap().state(), BaaState::Disabled);
    assert_eq!(mac.stats().pkts_purged_delba, 6);
    assert_eq!(mac.network().dropped.len(), 6);
}

#[test]
fn staged_msdus_count_against_the_output_queue() {
    let config = Dot11nConfig { enable_amsdu: true, mac_output_queue_size: 3, ..Dot11nConfig::default() };
    let mut sim = LinkSimulator::infrastructure(config, Dot11nConfig::default(), ChannelModel::default()).unwrap();
    for i in 0..8u8 {
        sim.push(0, tid(), vec![i; 64]);
    }
    sim.mac_mut(0).classify_packets(SimTime::ZERO);

    // the first two MSDUs leave as one A-MSDU; the next two wait behind it in staging
    let mac = sim.mac(0);
    let queued = mac.output_flow(&toward_b()).map_or(0, |f| f.num_packets());
    let staged = mac.staging_flow(&toward_b()).map_or(0, |f| f.num_packets());
    assert_eq!((queued, staged), (1, 2));
    assert_eq!(mac.stats().amsdus_created, 1);
    assert_eq!(mac.network().queued(), 4);
    assert_eq!(mac.stats().pkts_rejected_queue_full, 1);

    sim.mac_mut(0).classify_packets(SimTime::ZERO);
    assert_eq!(sim.mac(0).network().queued(), 4);
    assert_eq!(sim.mac(0).stats().pkts_rejected_queue_full, 2);

    sim.run_until_idle(10_000).unwrap();
    let delivered: Vec<u8> = sim.mac(1).network().delivered.iter().map(|(p, _)| p[0]).collect();
    assert_eq!(delivered, (0..8).collect::<Vec<u8>>());
}
