#![forbid(unsafe_code)]

//! Per-instance counters.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MacStats {
    pub pkts_sent_unicast: u64,
    pub pkts_sent_broadcast: u64,
    /// MSDUs handed to the network layer.
    pub pkts_received: u64,
    /// Frames dropped at the retry limit.
    pub pkts_dropped_dcf: u64,
    /// Frames purged by a block-ack teardown.
    pub pkts_purged_delba: u64,
    pub pkts_rejected_queue_full: u64,
    pub amsdus_created: u64,
    pub amsdus_received: u64,
    pub ampdus_sent: u64,
    pub ampdus_received: u64,
    pub subframes_corrupted: u64,
    pub ba_agreements_established: u64,
    pub ba_agreements_rejected: u64,
    pub addba_timeouts: u64,
    pub delba_sent: u64,
    pub delba_received: u64,
    pub bar_sent: u64,
    pub ba_received: u64,
    pub ba_sent: u64,
    pub seq_mismatch_drops: u64,
    pub duplicate_drops: u64,
    pub internal_collisions: u64,
    pub retransmissions: u64,
}
