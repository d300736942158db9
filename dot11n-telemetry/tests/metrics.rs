use dot11n_core::{Dot11nConfig, MacAddr, SimTime, Tid};
use dot11n_mac::testing::{MockManagement, MockNetwork};
use dot11n_mac::{Dot11nMac, HtPhy, MacStats};
use dot11n_telemetry::MacMetrics;

#[test]
fn render_exposes_per_node_series() {
    let metrics = MacMetrics::new().unwrap();
    let a = MacStats { pkts_sent_unicast: 12, ampdus_sent: 3, ..MacStats::default() };
    let b = MacStats { pkts_received: 7, ..MacStats::default() };
    metrics.observe("sta1", &a);
    metrics.observe("ap", &b);

    let text = metrics.render().unwrap();
    assert!(text.contains("dot11n_pkts_sent_unicast{node=\"sta1\"} 12"));
    assert!(text.contains("dot11n_ampdus_sent{node=\"sta1\"} 3"));
    assert!(text.contains("dot11n_pkts_received{node=\"ap\"} 7"));
    assert!(text.contains("# HELP dot11n_pkts_dropped_dcf Frames dropped at the retry limit"));
}

#[test]
fn repeated_snapshots_overwrite() {
    let metrics = MacMetrics::new().unwrap();
    metrics.observe("n", &MacStats { retransmissions: 4, ..MacStats::default() });
    metrics.observe("n", &MacStats { retransmissions: 5, ..MacStats::default() });
    let text = metrics.render().unwrap();
    assert!(text.contains("dot11n_retransmissions{node=\"n\"} 5"));
    assert!(!text.contains("dot11n_retransmissions{node=\"n\"} 9"));
}

#[test]
fn removed_node_disappears() {
    let metrics = MacMetrics::new().unwrap();
    metrics.observe("gone", &MacStats::default());
    metrics.remove("gone");
    assert!(!metrics.render().unwrap().contains("node=\"gone\""));
}

#[test]
fn live_mac_counters_are_mirrored() {
    let peer = MacAddr::from_node(2);
    let config = Dot11nConfig { mac_output_queue_size: 1, ..Dot11nConfig::default() };
    let mut mac = Dot11nMac::new(
        MacAddr::from_node(1),
        config,
        HtPhy::default(),
        MockNetwork::new(),
        MockManagement::access_point(),
    )
    .unwrap();
    let tid = Tid::from_priority(0);
    mac.network_mut().push(peer, tid, vec![0; 40]);
    mac.network_mut().push(peer, tid, vec![0; 40]);
    mac.classify_packets(SimTime::ZERO);
    assert_eq!(mac.stats().pkts_rejected_queue_full, 1);

    let metrics = MacMetrics::new().unwrap();
    metrics.observe("ap", mac.stats());
    assert!(metrics
        .render()
        .unwrap()
        .contains("dot11n_pkts_rejected_queue_full{node=\"ap\"} 1"));
}

#[test]
fn global_instance_is_shared() {
    let first = dot11n_telemetry::metrics().unwrap();
    let second = dot11n_telemetry::metrics().unwrap();
    assert!(std::ptr::eq(first, second));
}
