#![forbid(unsafe_code)]

//! Aggregation decisions: A-MSDU and A-MPDU sizing, and the packet counts that drive
//! block-ack negotiation and bursting.
//!
//! The two aggregate kinds treat their inputs differently:
//!
//! * [`aggregate_consuming`] removes the MSDUs from the staging flow; the A-MSDU shares one
//!   sequence number and one acknowledgement.
//! * [`aggregate_duplicating`] sends copies; the originals stay in the output flow as
//!   `AwaitingAck` until a block ack releases them one by one.
//!
//! All airtime figures are computed at the lowest MCS of the peer's usable spatial-stream
//! band and checked against the access category's TXOP limit. Categories without a TXOP
//! limit (background, best effort) skip the airtime check.

use dot11n_core::{MacAddr, SimTime, Tid};
use std::time::Duration;

use crate::ack::BLOCK_ACK_WINDOW;
use crate::ampdu::{self, AmpduFrame, MAX_MPDU_IN_AMPDU};
use crate::amsdu::{self, AmsduSubframe};
use crate::block_ack::{BLOCK_ACK_POLICY_THRESHOLD, MAX_MPDUS_NEGOTIATED_VIA_BA_POLICY};
use crate::buffer::FlowState;
use crate::builder::encode_mpdu;
use crate::capability::HtCapabilities;
use crate::frame::{FrameFlags, FrameKind, FrameState, MacFrame, FCS_LEN};
use crate::phy::PhyModel;
use crate::sequencer::SeqNum;

pub const MIN_MSDUS_IN_AMSDU: usize = 2;
pub const MIN_MPDUS_IN_AMPDU: usize = 2;
pub const MAX_MPDUS_IN_AMPDU: usize = 64;
/// Fewest packets worth a block-ack burst.
pub const MIN_PKTS_IN_TXOP_BAA: usize = 5;

const RTS_LEN: usize = 20;
const CTS_LEN: usize = 14;
const ACK_LEN: usize = 14;
const BLOCK_ACK_LEN: usize = 32;

/// Airtime calculator for one peer within one access category.
pub struct TxBudget<'a, P: PhyModel + ?Sized> {
    phy: &'a P,
    pub peer: MacAddr,
    pub mcs: u8,
    pub txop: Option<Duration>,
}

impl<'a, P: PhyModel + ?Sized> TxBudget<'a, P> {
    pub fn new(phy: &'a P, peer: MacAddr, caps: &HtCapabilities, txop: Option<Duration>) -> Self {
        let mcs = caps.min_usable_mcs(phy.max_antenna_elements());
        Self { phy, peer, mcs, txop }
    }

    #[must_use]
    pub fn sifs(&self) -> Duration {
        self.phy.sifs()
    }

    #[must_use]
    pub fn data_airtime(&self, len: usize) -> Duration {
        self.phy.transmission_duration(len, FrameKind::QosData, self.peer, Some(self.mcs))
    }

    fn control_airtime(&self, len: usize, kind: FrameKind) -> Duration {
        self.phy.transmission_duration(len, kind, self.peer, None)
    }

    /// RTS, SIFS, CTS, SIFS.
    #[must_use]
    pub fn protection(&self) -> Duration {
        self.control_airtime(RTS_LEN, FrameKind::Rts) + self.control_airtime(CTS_LEN, FrameKind::Cts) + self.sifs() * 2
    }

    /// SIFS then ACK.
    #[must_use]
    pub fn ack_exchange(&self) -> Duration {
        self.sifs() + self.control_airtime(ACK_LEN, FrameKind::Ack)
    }

    /// SIFS then BA.
    #[must_use]
    pub fn block_ack_exchange(&self) -> Duration {
        self.sifs() + self.control_airtime(BLOCK_ACK_LEN, FrameKind::BlockAck)
    }

    #[must_use]
    pub fn fits(&self, airtime: Duration) -> bool {
        self.txop.map_or(true, |limit| airtime <= limit)
    }
}

fn fresh(flow: &FlowState) -> impl Iterator<Item = &MacFrame> {
    flow.frames().filter(|f| f.state == FrameState::Fresh)
}

/// Number of leading staged MSDUs that fit one A-MSDU of at most `max_size` bytes, or `None`
/// when fewer than [`MIN_MSDUS_IN_AMSDU`] qualify.
pub fn amsdu_plan<P: PhyModel + ?Sized>(flow: &FlowState, max_size: usize, budget: &TxBudget<'_, P>) -> Option<usize> {
    let mut body = 0;
    let mut count = 0;
    for frame in flow.frames() {
        let as_last = body + amsdu::subframe_len(frame.payload_len(), true);
        if as_last > max_size {
            break;
        }
        let mpdu_len = FrameKind::QosData.header_len() + as_last + FCS_LEN;
        let airtime = budget.protection() + budget.data_airtime(mpdu_len) + budget.ack_exchange();
        if !budget.fits(airtime) {
            break;
        }
        body += amsdu::subframe_len(frame.payload_len(), false);
        count += 1;
    }
    (count >= MIN_MSDUS_IN_AMSDU).then_some(count)
}

/// Remove the first `count` staged MSDUs and pack them into one A-MSDU data frame.
pub fn aggregate_consuming(flow: &mut FlowState, count: usize, ra: MacAddr, ta: MacAddr, tid: Tid, now: SimTime) -> MacFrame {
    let subframes: Vec<AmsduSubframe> = (0..count)
        .filter_map(|_| flow.remove_front())
        .map(|f| AmsduSubframe { da: f.addr3, sa: f.ta, msdu: f.body })
        .collect();
    let mut frame = MacFrame::qos_data(ra, ta, tid, amsdu::build_amsdu(&subframes), now);
    frame.is_amsdu = true;
    frame
}

/// Queue indices of the frames that go into the next A-MPDU of `flow`, in order.
///
/// Unacknowledged frames of an open window lead, already acknowledged ones are skipped, and
/// fresh frames follow. The walk stops at the first frame that is neither, or when the
/// aggregate would exceed `max_len`, the TXOP, [`MAX_MPDUS_IN_AMPDU`] or the scoreboard span.
/// With an open window a single retransmission is enough; otherwise at least
/// [`MIN_MPDUS_IN_AMPDU`] frames are required.
pub fn ampdu_plan<P: PhyModel + ?Sized>(flow: &FlowState, max_len: usize, budget: &TxBudget<'_, P>) -> Option<Vec<usize>> {
    let window = flow.win_starts.filter(|_| flow.win_sizes > 0);
    let mut base = window;
    let mut total = 0;
    let mut picked = Vec::new();
    for (idx, frame) in flow.frames().enumerate() {
        match frame.state {
            FrameState::Acked => continue,
            FrameState::AwaitingAck => {
                let inside = match (window, frame.seq) {
                    (Some(start), Some(seq)) => seq.is_within(start, flow.win_sizes),
                    _ => false,
                };
                if !inside {
                    break;
                }
            }
            FrameState::Fresh => {}
        }
        if picked.len() == MAX_MPDUS_IN_AMPDU {
            break;
        }
        let Some(seq) = frame.seq else { break };
        if base.get_or_insert(seq).distance_to(seq) >= BLOCK_ACK_WINDOW {
            break;
        }
        let mpdu_len = frame.len();
        if mpdu_len > MAX_MPDU_IN_AMPDU {
            break;
        }
        let next = total + ampdu::subframe_len(mpdu_len);
        if next > max_len {
            break;
        }
        if !budget.fits(budget.protection() + budget.data_airtime(next) + budget.block_ack_exchange()) {
            break;
        }
        total = next;
        picked.push(idx);
    }
    let min = if window.is_some() { 1 } else { MIN_MPDUS_IN_AMPDU };
    (picked.len() >= min).then_some(picked)
}

/// Copies handed to the PHY by [`aggregate_duplicating`].
#[derive(Debug)]
pub struct Duplicated {
    pub ampdu: AmpduFrame,
    pub seqs: Vec<SeqNum>,
    pub retransmitted: usize,
}

/// Encode the frames at `indices` into one A-MPDU, marking the originals `AwaitingAck` and
/// growing the transmit window to cover them.
pub fn aggregate_duplicating(flow: &mut FlowState, indices: &[usize], ra: MacAddr, ta: MacAddr, tid: Tid, mcs: u8) -> Duplicated {
    let mut mpdus = Vec::with_capacity(indices.len());
    let mut seqs = Vec::with_capacity(indices.len());
    let mut retransmitted = 0;
    for &idx in indices {
        let Some(frame) = flow.get_mut(idx) else { continue };
        if frame.state == FrameState::AwaitingAck {
            frame.flags.insert(FrameFlags::RETRY);
            retransmitted += 1;
        }
        frame.state = FrameState::AwaitingAck;
        frame.is_ampdu = true;
        frame.ba_active = true;
        mpdus.push(encode_mpdu(frame));
        if let Some(seq) = frame.seq {
            seqs.push(seq);
        }
    }
    if let (Some(&first), Some(&last)) = (seqs.first(), seqs.last()) {
        let start = flow.win_starts.filter(|_| flow.win_sizes > 0).unwrap_or(first);
        flow.win_starts = Some(start);
        flow.win_sizes = flow.win_sizes.max(start.distance_to(last) + 1);
    }
    let ampdu = AmpduFrame { ra, ta, tid, mcs, num_subframes: mpdus.len(), payload: ampdu::build_ampdu(&mpdus) };
    Duplicated { ampdu, seqs, retransmitted }
}

/// Fresh frames that fit the TXOP as one block-ack burst, capped at
/// [`MAX_MPDUS_NEGOTIATED_VIA_BA_POLICY`]. An agreement is worth requesting only when more
/// than [`BLOCK_ACK_POLICY_THRESHOLD`] fit.
pub fn block_ack_policy_usable<P: PhyModel + ?Sized>(flow: &FlowState, budget: &TxBudget<'_, P>) -> Option<u16> {
    let mut airtime = budget.protection();
    let mut count: u16 = 0;
    for frame in fresh(flow) {
        airtime += budget.data_airtime(frame.len()) + budget.sifs();
        if !budget.fits(airtime) {
            break;
        }
        count += 1;
        if count == MAX_MPDUS_NEGOTIATED_VIA_BA_POLICY {
            break;
        }
    }
    (usize::from(count) > BLOCK_ACK_POLICY_THRESHOLD).then_some(count)
}

/// Packets of the next burst session: fresh frames that each fit the TXOP on their own,
/// bounded by the negotiated buffer. `None` below [`MIN_PKTS_IN_TXOP_BAA`].
pub fn calc_num_packets_sent_under_bap<P: PhyModel + ?Sized>(
    flow: &FlowState,
    negotiated: u16,
    budget: &TxBudget<'_, P>,
) -> Option<u16> {
    let bound = flow.fresh_count().min(usize::from(negotiated));
    let count = fresh(flow)
        .take(bound)
        .take_while(|f| budget.fits(budget.protection() + budget.data_airtime(f.len())))
        .count();
    (count >= MIN_PKTS_IN_TXOP_BAA).then(|| count as u16)
}

/// Packets of the remaining session that fit one TXOP: RTS, CTS, then DATA frames separated
/// by SIFS. At least one packet is always allowed.
pub fn calculate_num_packets_to_be_sent_in_txop<P: PhyModel + ?Sized>(
    flow: &FlowState,
    remaining: u16,
    budget: &TxBudget<'_, P>,
) -> u16 {
    let mut airtime = budget.protection();
    let mut count: u16 = 0;
    for frame in fresh(flow).take(usize::from(remaining)) {
        let end = airtime + budget.data_airtime(frame.len());
        if count > 0 && !budget.fits(end) {
            break;
        }
        airtime = end + budget.sifs();
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{FlowKey, OutputBuffer, StagingBuffer};
    use crate::phy::HtPhy;
    use bytes::Bytes;

    fn caps() -> HtCapabilities {
        HtCapabilities {
            max_mcs_index: 7,
            big_amsdu: false,
            immediate_ba: true,
            delayed_ba: true,
            rifs: false,
            ampdu_length_exponent: 3,
        }
    }

    fn key() -> FlowKey {
        FlowKey::new(MacAddr::from_node(2), Tid::from_priority(5))
    }

    fn msdu(len: usize) -> MacFrame {
        MacFrame::qos_data(key().peer, MacAddr::from_node(1), key().tid, Bytes::from(vec![7u8; len]), SimTime::ZERO)
    }

    fn staged(lens: &[usize]) -> StagingBuffer {
        let mut buf = StagingBuffer::new();
        for &len in lens {
            buf.enqueue(key(), msdu(len), SimTime::ZERO);
        }
        buf
    }

    fn queued(count: usize, len: usize) -> OutputBuffer {
        let mut buf = OutputBuffer::new();
        for _ in 0..count {
            buf.enqueue(key(), msdu(len), SimTime::ZERO);
        }
        buf
    }

    #[test]
    fn two_small_msdus_make_one_amsdu() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let mut buf = staged(&[200, 200]);
        let flow = buf.get_mut(&key()).unwrap();
        assert_eq!(amsdu_plan(flow, 3839, &budget), Some(2));
        let frame = aggregate_consuming(flow, 2, key().peer, MacAddr::from_node(1), key().tid, SimTime::ZERO);
        assert!(frame.is_amsdu);
        assert_eq!(frame.payload_len(), 216 + 214);
        assert!(flow.is_empty());
        flow.assert_consistent();
    }

    #[test]
    fn amsdu_stops_at_size_limit() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let buf = staged(&[1500, 1500, 1500]);
        assert_eq!(amsdu_plan(buf.get(&key()).unwrap(), 3839, &budget), Some(2));
        let single = staged(&[3000, 1000]);
        assert_eq!(amsdu_plan(single.get(&key()).unwrap(), 3839, &budget), None);
    }

    #[test]
    fn amsdu_respects_txop() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), Some(Duration::from_micros(300)));
        let buf = staged(&[1500, 1500]);
        assert_eq!(amsdu_plan(buf.get(&key()).unwrap(), 7935, &budget), None);
    }

    #[test]
    fn ampdu_duplicates_and_opens_window() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let mut buf = queued(3, 100);
        let flow = buf.get_mut(&key()).unwrap();
        let picked = ampdu_plan(flow, 65_535, &budget).unwrap();
        assert_eq!(picked, vec![0, 1, 2]);
        let dup = aggregate_duplicating(flow, &picked, key().peer, MacAddr::from_node(1), key().tid, budget.mcs);
        assert_eq!(dup.ampdu.num_subframes, 3);
        assert_eq!(dup.retransmitted, 0);
        assert_eq!(flow.num_packets(), 3);
        assert!(flow.frames().all(|f| f.state == FrameState::AwaitingAck));
        assert_eq!((flow.win_starts, flow.win_sizes), (Some(SeqNum::new(0)), 3));
    }

    #[test]
    fn single_fresh_frame_is_not_an_ampdu() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let buf = queued(1, 100);
        assert!(ampdu_plan(buf.get(&key()).unwrap(), 65_535, &budget).is_none());
    }

    #[test]
    fn retransmissions_lead_and_acked_frames_are_skipped() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let mut buf = queued(5, 100);
        let flow = buf.get_mut(&key()).unwrap();
        let first = ampdu_plan(flow, 65_535, &budget).unwrap();
        aggregate_duplicating(flow, &first[..3], key().peer, MacAddr::from_node(1), key().tid, budget.mcs);
        crate::block_ack::apply_block_ack(flow, SeqNum::new(0), 0b101).unwrap();
        // seq 0 freed, 1 awaiting, 2 acked, 3 and 4 fresh
        let picked = ampdu_plan(flow, 65_535, &budget).unwrap();
        let seqs: Vec<_> = picked.iter().map(|&i| flow.get(i).unwrap().seq.unwrap().value()).collect();
        assert_eq!(seqs, vec![1, 3, 4]);
        let dup = aggregate_duplicating(flow, &picked, key().peer, MacAddr::from_node(1), key().tid, budget.mcs);
        assert_eq!(dup.retransmitted, 1);
        assert_eq!((flow.win_starts, flow.win_sizes), (Some(SeqNum::new(1)), 4));
    }

    #[test]
    fn ampdu_length_limit_applies() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let buf = queued(10, 1000);
        let picked = ampdu_plan(buf.get(&key()).unwrap(), 8191, &budget).unwrap();
        assert_eq!(picked.len(), 7);
    }

    #[test]
    fn policy_usable_needs_more_than_threshold() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let five = queued(5, 100);
        assert_eq!(block_ack_policy_usable(five.get(&key()).unwrap(), &budget), None);
        let six = queued(6, 100);
        assert_eq!(block_ack_policy_usable(six.get(&key()).unwrap(), &budget), Some(6));
        let many = queued(80, 100);
        assert_eq!(block_ack_policy_usable(many.get(&key()).unwrap(), &budget), Some(64));
    }

    #[test]
    fn burst_counts_are_bounded_by_negotiation_and_txop() {
        let phy = HtPhy::default();
        let budget = TxBudget::new(&phy, key().peer, &caps(), None);
        let buf = queued(20, 100);
        let flow = buf.get(&key()).unwrap();
        assert_eq!(calc_num_packets_sent_under_bap(flow, 8, &budget), Some(8));
        assert_eq!(calc_num_packets_sent_under_bap(flow, 4, &budget), None);

        let tight = TxBudget::new(&phy, key().peer, &caps(), Some(Duration::from_micros(600)));
        let per_txop = calculate_num_packets_to_be_sent_in_txop(flow, 20, &tight);
        assert!(per_txop >= 1 && per_txop < 20);
        assert_eq!(calculate_num_packets_to_be_sent_in_txop(flow, 20, &budget), 20);
    }
}
