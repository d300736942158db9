#![forbid(unsafe_code)]

//! Transmit side of [`Dot11nMac`]: EDCA contention, frame preparation, and the handling of
//! transmission outcomes reported by the PHY.
//!
//! Each access category holds at most one prepared [`PendingTx`]. A prepared unit is one of
//!
//! * a single MPDU moved out of its output flow,
//! * an A-MPDU of copies whose originals stay queued as `AwaitingAck`,
//! * one frame of a block-ack burst, also a copy.
//!
//! Block-ack requests and the other management frames go through the management plane and
//! report back via `on_management_tx_status`.

use bytes::Bytes;
use dot11n_core::{MacAddr, SimTime, Tid};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::ack::{build_bar, BlockAckRequest};
use crate::aggregation::{
    aggregate_duplicating, ampdu_plan, block_ack_policy_usable, calc_num_packets_sent_under_bap,
    calculate_num_packets_to_be_sent_in_txop, TxBudget,
};
use crate::ampdu::AmpduFrame;
use crate::amsdu::parse_amsdu;
use crate::block_ack::{BaaState, BlockAckAgreement};
use crate::buffer::{FlowKey, FlowState};
use crate::capability::HtCapabilities;
use crate::congestion::RetryVerdict;
use crate::errors::{MacError, MacResult};
use crate::frame::{AckPolicy, FrameFlags, FrameKind, FrameState, MacFrame};
use crate::interfaces::{ManagementPlane, NetworkLayer, OutboundPacket};
use crate::layer::Dot11nMac;
use crate::management::{build_action, AddbaRequest, BaParameters, BlockAckAction};
use crate::phy::PhyModel;
use crate::scheduler::{pause_other_backoffs, select_active_ac};
use crate::sequencer::SeqNum;

/// Unit prepared by an access category and not yet confirmed by the PHY.
#[derive(Debug, Clone)]
pub enum PendingTx {
    Single { key: FlowKey, frame: MacFrame },
    Ampdu { key: FlowKey, ampdu: AmpduFrame, seqs: Vec<SeqNum> },
    Burst { key: FlowKey, frame: MacFrame },
}

impl PendingTx {
    #[must_use]
    pub fn key(&self) -> FlowKey {
        match self {
            PendingTx::Single { key, .. } | PendingTx::Ampdu { key, .. } | PendingTx::Burst { key, .. } => *key,
        }
    }

    /// Length on air, used to pick the short or long retry counter.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            PendingTx::Single { frame, .. } | PendingTx::Burst { frame, .. } => frame.len(),
            PendingTx::Ampdu { ampdu, .. } => ampdu.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What goes on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxUnit {
    Mpdu(MacFrame),
    Ampdu(AmpduFrame),
}

impl TxUnit {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TxUnit::Mpdu(frame) => frame.len(),
            TxUnit::Ampdu(ampdu) => ampdu.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn ra(&self) -> MacAddr {
        match self {
            TxUnit::Mpdu(frame) => frame.ra,
            TxUnit::Ampdu(ampdu) => ampdu.ra,
        }
    }
}

/// A transmission granted by contention.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub ac: usize,
    pub unit: TxUnit,
    /// Idle time before the first bit: AIFS plus backoff, or SIFS/RIFS inside a burst.
    pub access_delay: Duration,
    pub airtime: Duration,
    pub use_rts: bool,
    pub use_rifs: bool,
    /// An ACK (single MPDU) or BA (A-MPDU) is due after SIFS.
    pub expects_response: bool,
}

/// Outcome of a data transmission as seen by the PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// The expected response arrived.
    Acked,
    /// No response was expected.
    Sent,
    Failed,
}

enum BurstStep {
    Frame(MacFrame),
    SessionComplete,
    NotApplicable,
}

/// A flow can be serviced: it holds an unacknowledged frame and no agreement holds it back.
pub(crate) fn is_sendable(flow: &FlowState) -> bool {
    !flow.is_ba_transitional() && flow.frames().any(|f| f.state != FrameState::Acked)
}

/// Network-layer packets carried by `frame`, one per MSDU.
pub(crate) fn outbound_packets(frame: &MacFrame) -> Vec<OutboundPacket> {
    let priority = frame.tid.unwrap_or_else(|| Tid::from_priority(0));
    if frame.is_amsdu {
        if let Ok(subframes) = parse_amsdu(&frame.body) {
            return subframes
                .into_iter()
                .map(|s| OutboundPacket { payload: s.msdu, next_hop: frame.ra, priority })
                .collect();
        }
    }
    vec![OutboundPacket { payload: frame.body.clone(), next_hop: frame.ra, priority }]
}

pub(crate) fn action_frame(ra: MacAddr, ta: MacAddr, action: &BlockAckAction, now: SimTime) -> MacFrame {
    MacFrame::new(FrameKind::Action, ra, ta, build_action(action), now)
}

fn first_fresh_seq(flow: &FlowState) -> Option<SeqNum> {
    flow.frames().find(|f| f.state == FrameState::Fresh).and_then(|f| f.seq)
}

/// Duration in 1024 µs time units.
fn to_time_units(timeout: Duration) -> u16 {
    u16::try_from(timeout.as_micros() / 1024).unwrap_or(u16::MAX)
}

/// Advance a block-ack burst of `flow` by one frame.
fn next_burst_frame<P: PhyModel + ?Sized>(flow: &mut FlowState, key: &FlowKey, budget: &TxBudget<'_, P>) -> BurstStep {
    let Some(agreement) = flow.agreement.as_ref() else {
        return BurstStep::NotApplicable;
    };
    match agreement.state() {
        BaaState::Idle => {
            if flow.win_starts.is_some() {
                return BurstStep::NotApplicable;
            }
            let negotiated = agreement.num_pkts_negotiated;
            let Some(session) = calc_num_packets_sent_under_bap(flow, negotiated, budget) else {
                return BurstStep::NotApplicable;
            };
            let first_txop = calculate_num_packets_to_be_sent_in_txop(flow, session, budget);
            let start = first_fresh_seq(flow);
            flow.win_starts = start;
            flow.win_sizes = 0;
            if let Some(a) = flow.agreement.as_mut() {
                a.transition(key, BaaState::Transmitting);
                a.num_pkts_in_session = session;
                a.num_pkts_sent = 0;
                a.num_pkts_left_in_txop = first_txop;
                a.nav_duration = budget.txop.unwrap_or_default();
            }
            debug!(flow = %key, session, first_txop, "burst started");
        }
        BaaState::Transmitting => {
            if agreement.num_pkts_left_in_txop == 0 {
                let remaining = agreement.num_pkts_in_session.saturating_sub(agreement.num_pkts_sent);
                let left = calculate_num_packets_to_be_sent_in_txop(flow, remaining, budget);
                if let Some(a) = flow.agreement.as_mut() {
                    a.num_pkts_left_in_txop = left;
                }
            }
        }
        _ => return BurstStep::NotApplicable,
    }

    let negotiated = flow.agreement.as_ref().map_or(1, |a| a.num_pkts_negotiated.max(1));
    let start = flow.win_starts;
    let next = flow
        .frames()
        .position(|f| f.state == FrameState::Fresh)
        .and_then(|idx| flow.get(idx).and_then(|f| f.seq).map(|seq| (idx, seq)))
        // the recipient window must cover the whole session
        .filter(|&(_, seq)| start.is_some_and(|s| s.distance_to(seq) < negotiated));
    match next {
        Some((idx, seq)) => {
            let Some(frame) = flow.get_mut(idx) else {
                return BurstStep::NotApplicable;
            };
            frame.state = FrameState::AwaitingAck;
            frame.ack_policy = AckPolicy::BlockAck;
            frame.ba_active = true;
            let copy = frame.clone();
            if let Some(s) = start {
                flow.win_sizes = s.distance_to(seq) + 1;
            }
            BurstStep::Frame(copy)
        }
        None => {
            if let Some(a) = flow.agreement.as_mut() {
                a.num_pkts_in_session = a.num_pkts_sent;
            }
            BurstStep::SessionComplete
        }
    }
}

impl<P: PhyModel, N: NetworkLayer, M: ManagementPlane> Dot11nMac<P, N, M> {
    /// Run one round of EDCA contention. Returns the transmission of the winning access
    /// category, or `None` when nothing is ready. The caller reports its outcome through
    /// [`Dot11nMac::on_tx_status`] before contending again.
    pub fn contend(&mut self, now: SimTime) -> MacResult<Option<Transmission>> {
        if self.active.is_some() {
            warn!(addr = %self.addr, "contention while a transmission is outstanding");
            return Ok(None);
        }
        if let Some(ac) = self.acs.iter().position(|a| a.txop_continuation.is_some()) {
            if let Some(key) = self.acs[ac].txop_continuation.take() {
                if let Some(caps) = self.peer_capabilities(key.peer) {
                    self.try_prepare_burst(ac, key, &caps, now);
                }
                if self.acs[ac].pending.is_some() {
                    let rifs = self.peer_uses_rifs(key.peer);
                    let ifs = if rifs { self.phy.rifs() } else { self.phy.sifs() };
                    return self.launch(ac, ifs, rifs, true).map(Some);
                }
            }
        }

        let (sifs, slot) = (self.phy.sifs(), self.phy.slot_time());
        // a winner may turn out to have nothing to send once its flows are inspected
        for _ in 0..=self.acs.len() {
            self.refresh_all();
            let Some(winner) = select_active_ac(&self.acs, sifs, slot) else {
                return Ok(None);
            };
            let access_delay = self.acs[winner].aifs(sifs, slot) + self.acs[winner].backoff;
            for loser in pause_other_backoffs(&mut self.acs, winner, sifs, slot) {
                self.internal_collision(loser, now)?;
            }
            if self.acs[winner].pending.is_none() {
                self.prepare(winner, now)?;
            }
            if self.acs[winner].pending.is_some() {
                return self.launch(winner, access_delay, false, false).map(Some);
            }
            self.acs[winner].backoff = self.acs[winner].contention.draw_backoff(&mut self.rng, slot);
        }
        Ok(None)
    }

    fn launch(&mut self, ac: usize, access_delay: Duration, use_rifs: bool, continuation: bool) -> MacResult<Transmission> {
        let Some(pending) = self.acs[ac].pending.as_ref() else {
            return Err(MacError::Codec("launch without a prepared frame".into()));
        };
        let (unit, airtime, expects_response) = match pending {
            PendingTx::Single { frame, .. } => {
                let airtime = self.phy.transmission_duration(frame.len(), frame.kind, frame.ra, None);
                let wants_ack = !frame.is_group() && frame.ack_policy == AckPolicy::Normal;
                (TxUnit::Mpdu(frame.clone()), airtime, wants_ack)
            }
            PendingTx::Burst { key, frame } => {
                let mcs = self
                    .peer_capabilities(key.peer)
                    .map(|c| c.min_usable_mcs(self.phy.max_antenna_elements()));
                let airtime = self.phy.transmission_duration(frame.len(), frame.kind, frame.ra, mcs);
                (TxUnit::Mpdu(frame.clone()), airtime, false)
            }
            PendingTx::Ampdu { ampdu, .. } => {
                let airtime = self.phy.transmission_duration(ampdu.len(), FrameKind::QosData, ampdu.ra, Some(ampdu.mcs));
                (TxUnit::Ampdu(ampdu.clone()), airtime, true)
            }
        };
        let use_rts = !continuation && unit.len() > self.config.rts_threshold;
        self.active = Some(ac);
        trace!(
            addr = %self.addr,
            ac = self.acs[ac].ac.label(),
            bytes = unit.len(),
            delay_us = access_delay.as_micros() as u64,
            "transmission granted"
        );
        Ok(Transmission { ac, unit, access_delay, airtime, use_rts, use_rifs, expects_response })
    }

    /// Fill the pending slot of `ac` from its next serviceable flow: a burst frame when a
    /// block-ack agreement allows it, else an A-MPDU, else a single MPDU.
    pub(crate) fn prepare(&mut self, ac: usize, now: SimTime) -> MacResult<()> {
        let Some(key) = self.acs[ac].output.next_flow_where(|_, flow| is_sendable(flow)) else {
            return Ok(());
        };
        if let Some(caps) = self.peer_capabilities(key.peer) {
            if self.try_prepare_burst(ac, key, &caps, now) {
                return Ok(());
            }
            if self.config.enable_ampdu && self.try_prepare_ampdu(ac, key, &caps)? {
                return Ok(());
            }
        }
        self.prepare_single(ac, key)
    }

    /// Returns `true` when the flow is bursting: a frame was prepared or the session ended.
    fn try_prepare_burst(&mut self, ac: usize, key: FlowKey, caps: &HtCapabilities, now: SimTime) -> bool {
        if key.peer.is_group() {
            return false;
        }
        let txop = self.acs[ac].txop_limit();
        let budget = TxBudget::new(&self.phy, key.peer, caps, txop);
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return false;
        };
        match next_burst_frame(flow, &key, &budget) {
            BurstStep::Frame(frame) => {
                self.acs[ac].pending = Some(PendingTx::Burst { key, frame });
                true
            }
            BurstStep::SessionComplete => {
                self.queue_block_ack_request(ac, key, now);
                true
            }
            BurstStep::NotApplicable => false,
        }
    }

    fn try_prepare_ampdu(&mut self, ac: usize, key: FlowKey, caps: &HtCapabilities) -> MacResult<bool> {
        if key.peer.is_group() {
            return Ok(false);
        }
        let max_len = caps.max_ampdu_length().min(self.config.max_ampdu_length());
        let threshold = self.config.fragmentation_threshold;
        let budget = TxBudget::new(&self.phy, key.peer, caps, self.acs[ac].txop_limit());
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return Ok(false);
        };
        if flow.is_ba_transitional() {
            return Ok(false);
        }
        let Some(picked) = ampdu_plan(flow, max_len, &budget) else {
            return Ok(false);
        };
        if let Some(size) = picked.iter().filter_map(|&i| flow.get(i)).map(MacFrame::len).find(|&l| l > threshold) {
            return Err(MacError::FragmentationRequired { size, threshold });
        }
        let dup = aggregate_duplicating(flow, &picked, key.peer, self.addr, key.tid, budget.mcs);
        self.stats.retransmissions += dup.retransmitted as u64;
        debug!(
            flow = %key,
            subframes = dup.ampdu.num_subframes,
            bytes = dup.ampdu.len(),
            retransmitted = dup.retransmitted,
            "A-MPDU created"
        );
        self.acs[ac].pending = Some(PendingTx::Ampdu { key, ampdu: dup.ampdu, seqs: dup.seqs });
        Ok(true)
    }

    fn prepare_single(&mut self, ac: usize, key: FlowKey) -> MacResult<()> {
        let threshold = self.config.fragmentation_threshold;
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return Ok(());
        };
        if flow.win_starts.is_some() && flow.agreement.as_ref().map_or(true, |a| a.state() != BaaState::Transmitting) {
            flow.reset_tx_window();
        }
        let Some(idx) = flow.frames().position(|f| f.state == FrameState::Fresh) else {
            return Ok(());
        };
        let size = flow.get(idx).map_or(0, MacFrame::len);
        if size > threshold {
            return Err(MacError::FragmentationRequired { size, threshold });
        }
        let Some(mut frame) = flow.remove_at(idx) else {
            return Ok(());
        };
        frame.ack_policy = if frame.is_group() { AckPolicy::NoAck } else { AckPolicy::Normal };
        frame.is_ampdu = false;
        frame.ba_active = false;
        self.acs[ac].pending = Some(PendingTx::Single { key, frame });
        Ok(())
    }

    fn internal_collision(&mut self, ac: usize, now: SimTime) -> MacResult<()> {
        self.stats.internal_collisions += 1;
        if self.acs[ac].pending.is_none() {
            self.prepare(ac, now)?;
        }
        trace!(addr = %self.addr, ac = self.acs[ac].ac.label(), "internal collision");
        self.handle_failure(ac, now);
        let slot = self.phy.slot_time();
        self.acs[ac].backoff = self.acs[ac].contention.draw_backoff(&mut self.rng, slot);
        self.refresh_has_packet(ac);
        Ok(())
    }

    /// Outcome of the transmission last returned by [`Dot11nMac::contend`].
    pub fn on_tx_status(&mut self, now: SimTime, status: TxStatus) {
        let Some(ac) = self.active.take() else {
            warn!(addr = %self.addr, ?status, "tx status without a transmission");
            return;
        };
        let burst = matches!(self.acs[ac].pending, Some(PendingTx::Burst { .. }));
        // burst frames carry the block-ack policy; the BAR/BA exchange settles their fate
        if status == TxStatus::Failed && !burst {
            self.handle_failure(ac, now);
        } else if let Some(pending) = self.acs[ac].pending.take() {
            self.on_success(ac, pending, now);
        }
        if self.acs[ac].txop_continuation.is_none() {
            let slot = self.phy.slot_time();
            self.acs[ac].backoff = self.acs[ac].contention.draw_backoff(&mut self.rng, slot);
        }
        self.refresh_all();
    }

    fn on_success(&mut self, ac: usize, pending: PendingTx, now: SimTime) {
        match pending {
            PendingTx::Single { key, frame } => {
                self.acs[ac].contention.on_success();
                if frame.is_group() {
                    self.stats.pkts_sent_broadcast += 1;
                } else {
                    self.stats.pkts_sent_unicast += 1;
                    self.consider_block_ack(ac, key, now);
                }
                self.service_staging(key, now, false);
            }
            PendingTx::Ampdu { key, seqs, .. } => {
                self.acs[ac].contention.on_success();
                self.stats.ampdus_sent += 1;
                trace!(flow = %key, subframes = seqs.len(), "A-MPDU delivered to the air");
            }
            PendingTx::Burst { key, .. } => self.burst_frame_sent(ac, key, now),
        }
    }

    fn burst_frame_sent(&mut self, ac: usize, key: FlowKey, now: SimTime) {
        let Some(agreement) = self.acs[ac].output.get_mut(&key).and_then(|f| f.agreement.as_mut()) else {
            return;
        };
        agreement.num_pkts_sent += 1;
        agreement.num_pkts_left_in_txop = agreement.num_pkts_left_in_txop.saturating_sub(1);
        let done = agreement.num_pkts_sent >= agreement.num_pkts_in_session;
        let more_in_txop = agreement.num_pkts_left_in_txop > 0;
        if done {
            self.acs[ac].contention.on_success();
            self.queue_block_ack_request(ac, key, now);
        } else if more_in_txop {
            self.acs[ac].txop_continuation = Some(key);
        } else {
            self.acs[ac].contention.on_success();
        }
    }

    /// A failed or internally collided transmission of `ac`.
    fn handle_failure(&mut self, ac: usize, now: SimTime) {
        let Some(mut pending) = self.acs[ac].pending.take() else {
            return;
        };
        let verdict = self.acs[ac].contention.on_failure(pending.len(), self.config.rts_threshold);
        match verdict {
            RetryVerdict::Retry => {
                self.stats.retransmissions += 1;
                if let PendingTx::Single { frame, .. } = &mut pending {
                    frame.flags.insert(FrameFlags::RETRY);
                }
                // A-MPDU frames stay AwaitingAck and lead the next aggregate
                if !matches!(pending, PendingTx::Ampdu { .. }) {
                    self.acs[ac].pending = Some(pending);
                }
            }
            RetryVerdict::Drop => match pending {
                PendingTx::Single { key, frame } => {
                    debug!(flow = %key, seq = ?frame.seq, "retry limit reached");
                    self.drop_frame(frame);
                    self.service_staging(key, now, false);
                }
                PendingTx::Ampdu { key, .. } => self.drop_window(ac, key),
                PendingTx::Burst { key, .. } => self.abort_burst(ac, key),
            },
        }
    }

    pub(crate) fn drop_frame(&mut self, frame: MacFrame) {
        self.stats.pkts_dropped_dcf += 1;
        for packet in outbound_packets(&frame) {
            self.net.packet_dropped(packet);
        }
    }

    /// Give up on every unacknowledged frame of an A-MPDU window.
    fn drop_window(&mut self, ac: usize, key: FlowKey) {
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return;
        };
        let window = flow.win_starts.filter(|_| flow.win_sizes > 0).map(|s| (s, flow.win_sizes));
        let drained = match window {
            Some((start, size)) => flow.drain_where(|f| f.seq.is_some_and(|s| s.is_within(start, size))),
            None => Vec::new(),
        };
        flow.reset_tx_window();
        debug!(flow = %key, frames = drained.len(), "A-MPDU window dropped");
        for frame in drained {
            if frame.state == FrameState::Acked {
                self.stats.pkts_sent_unicast += 1;
            } else {
                self.drop_frame(frame);
            }
        }
    }

    /// Retry exhaustion inside a burst: drop the head frame and return to `Idle`.
    pub(crate) fn abort_burst(&mut self, ac: usize, key: FlowKey) {
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return;
        };
        let head = flow.win_starts.and_then(|s| flow.position_of(s)).or_else(|| (!flow.is_empty()).then_some(0));
        let dropped = head.and_then(|idx| flow.remove_at(idx));
        flow.reset_tx_window();
        if let Some(a) = flow.agreement.as_mut() {
            a.reset_session();
            a.transition(&key, BaaState::Idle);
        }
        if matches!(&self.acs[ac].pending, Some(PendingTx::Burst { key: k, .. }) if *k == key) {
            self.acs[ac].pending = None;
        }
        if self.acs[ac].txop_continuation == Some(key) {
            self.acs[ac].txop_continuation = None;
        }
        warn!(flow = %key, "burst abandoned at retry limit");
        if let Some(frame) = dropped {
            self.drop_frame(frame);
        }
    }

    /// End the burst session of `key` and queue the block-ack request for it.
    pub(crate) fn queue_block_ack_request(&mut self, ac: usize, key: FlowKey, now: SimTime) {
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return;
        };
        let ssn = flow.win_starts.unwrap_or(flow.seq_num);
        if let Some(a) = flow.agreement.as_mut() {
            a.transition(&key, BaaState::BlockAckRequestQueued);
        }
        let bar = BlockAckRequest { tid: key.tid, ssn, no_ack: false };
        let frame = MacFrame::new(FrameKind::BlockAckRequest, key.peer, self.addr, build_bar(&bar), now);
        debug!(flow = %key, ssn = ssn.value(), "BAR queued");
        self.mgmt.enqueue_management_frame(frame, true);
        self.refresh_has_packet(ac);
    }

    /// After an acknowledged single MPDU, open negotiation when enough traffic is queued.
    fn consider_block_ack(&mut self, ac: usize, key: FlowKey, now: SimTime) {
        let Some(caps) = self.peer_capabilities(key.peer) else {
            return;
        };
        let amsdu_supported = self.config.enable_amsdu;
        let timeout_tu = to_time_units(self.config.block_ack_policy_timeout());
        let budget = TxBudget::new(&self.phy, key.peer, &caps, self.acs[ac].txop_limit());
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return;
        };
        if flow.agreement.as_ref().map(BlockAckAgreement::state) != Some(BaaState::Disabled) {
            return;
        }
        let Some(requested) = block_ack_policy_usable(flow, &budget) else {
            return;
        };
        let ssn = first_fresh_seq(flow).unwrap_or(flow.seq_num);
        self.dialog_token = self.dialog_token.wrapping_add(1).max(1);
        let dialog_token = self.dialog_token;
        let Some(agreement) = flow.agreement.as_mut() else {
            return;
        };
        agreement.transition(&key, BaaState::AddbaRequestPending);
        agreement.num_pkts_negotiated = requested;
        agreement.starting_seq = Some(ssn);
        agreement.dialog_token = dialog_token;
        let params = BaParameters { amsdu_supported, ba_type: agreement.ba_type, tid: key.tid, buffer_size: requested };
        agreement.transition(&key, BaaState::AddbaRequestQueued);
        let request = BlockAckAction::AddbaRequest(AddbaRequest { dialog_token, params, timeout_tu, ssn });
        debug!(flow = %key, requested, ssn = ssn.value(), "ADDBA request queued");
        let frame = action_frame(key.peer, self.addr, &request, now);
        self.mgmt.enqueue_management_frame(frame, true);
    }

    /// Discard frames after a DELBA. With `all` every queued frame goes, otherwise only the
    /// ones already sent or inside the transmit window.
    pub(crate) fn purge_initiator_flow(&mut self, ac: usize, key: FlowKey, all: bool) {
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return;
        };
        let window = flow.win_starts.map(|s| (s, flow.win_sizes));
        let purged = flow.drain_where(|f| {
            all || f.state != FrameState::Fresh
                || window.is_some_and(|(start, size)| f.seq.is_some_and(|s| s.is_within(start, size)))
        });
        flow.reset_tx_window();
        if let Some(a) = flow.agreement.as_mut() {
            a.reset_session();
            a.transition(&key, BaaState::Disabled);
        }
        if matches!(&self.acs[ac].pending, Some(PendingTx::Ampdu { key: k, .. } | PendingTx::Burst { key: k, .. }) if *k == key) {
            self.acs[ac].pending = None;
        }
        if self.acs[ac].txop_continuation == Some(key) {
            self.acs[ac].txop_continuation = None;
        }
        self.stats.pkts_purged_delba += purged.len() as u64;
        debug!(flow = %key, purged = purged.len(), "flow purged after DELBA");
        for frame in purged {
            for packet in outbound_packets(&frame) {
                self.net.packet_dropped(packet);
            }
        }
    }
}

/// Empty body helper for control responses.
pub(crate) fn control_frame(kind: FrameKind, ra: MacAddr, ta: MacAddr, now: SimTime) -> MacFrame {
    MacFrame::new(kind, ra, ta, Bytes::new(), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::{build_block_ack, parse_block_ack, BlockAck};
    use crate::block_ack::BaaState;
    use crate::capability::PeerRecord;
    use crate::phy::HtPhy;
    use crate::testing::{full_ht, MockManagement, MockNetwork};
    use dot11n_core::{AccessCategory, Dot11nConfig};

    type TestMac = Dot11nMac<HtPhy, MockNetwork, MockManagement>;

    const ME: MacAddr = MacAddr::from_node(1);
    const PEER: MacAddr = MacAddr::from_node(2);

    fn ap(config: Dot11nConfig, ht: bool) -> TestMac {
        let mgmt = MockManagement::access_point().with_peer(PeerRecord { addr: PEER, ht: ht.then(full_ht) });
        Dot11nMac::new(ME, config, HtPhy::default(), MockNetwork::new(), mgmt).unwrap()
    }

    fn station(config: Dot11nConfig) -> TestMac {
        let mgmt = MockManagement::station(PeerRecord { addr: ME, ht: Some(full_ht()) });
        Dot11nMac::new(PEER, config, HtPhy::default(), MockNetwork::new(), mgmt).unwrap()
    }

    fn load(mac: &mut TestMac, count: usize, len: usize) -> FlowKey {
        let tid = Tid::from_priority(0);
        for i in 0..count {
            mac.network_mut().push(PEER, tid, vec![i as u8; len]);
        }
        mac.classify_packets(SimTime::ZERO);
        FlowKey::new(PEER, tid)
    }

    fn mpdu(tx: &Transmission) -> &MacFrame {
        match &tx.unit {
            TxUnit::Mpdu(frame) => frame,
            TxUnit::Ampdu(_) => panic!("expected a single MPDU"),
        }
    }

    #[test]
    fn retry_limit_drops_single_frame() {
        let config = Dot11nConfig { short_retry_limit: 3, ..Dot11nConfig::default() };
        let mut mac = ap(config, false);
        load(&mut mac, 1, 100);
        let now = SimTime::ZERO;

        for attempt in 0..2u8 {
            let tx = mac.contend(now).unwrap().unwrap();
            assert!(tx.expects_response);
            assert_eq!(mpdu(&tx).flags.contains(FrameFlags::RETRY), attempt > 0);
            mac.on_tx_status(now, TxStatus::Failed);
        }
        let be = AccessCategory::BestEffort;
        assert_eq!(mac.access_category(be).contention.qsrc(), 2);
        assert_eq!(mac.stats().pkts_dropped_dcf, 0);

        mac.contend(now).unwrap().unwrap();
        mac.on_tx_status(now, TxStatus::Failed);
        assert_eq!(mac.stats().pkts_dropped_dcf, 1);
        assert_eq!(mac.network().dropped.len(), 1);
        assert_eq!(mac.access_category(be).contention.qsrc(), 0);
        assert_eq!(mac.access_category(be).contention.qlrc(), 0);
        assert!(mac.contend(now).unwrap().is_none());
    }

    #[test]
    fn acked_single_counts_as_sent() {
        let mut mac = ap(Dot11nConfig::default(), false);
        load(&mut mac, 2, 50);
        let tx = mac.contend(SimTime::ZERO).unwrap().unwrap();
        assert_eq!(mpdu(&tx).seq, Some(SeqNum::ZERO));
        mac.on_tx_status(SimTime::ZERO, TxStatus::Acked);
        assert_eq!(mac.stats().pkts_sent_unicast, 1);
        assert_eq!(mac.queued_frames(), 1);
    }

    #[test]
    fn group_frames_expect_no_ack() {
        let mut mac = ap(Dot11nConfig::default(), false);
        mac.network_mut().push(MacAddr::BROADCAST, Tid::from_priority(0), vec![1; 30]);
        mac.classify_packets(SimTime::ZERO);
        let tx = mac.contend(SimTime::ZERO).unwrap().unwrap();
        assert!(!tx.expects_response);
        assert_eq!(mpdu(&tx).ack_policy, AckPolicy::NoAck);
        mac.on_tx_status(SimTime::ZERO, TxStatus::Sent);
        assert_eq!(mac.stats().pkts_sent_broadcast, 1);
    }

    #[test]
    fn oversized_frame_reports_fragmentation() {
        let config = Dot11nConfig { fragmentation_threshold: 500, ..Dot11nConfig::default() };
        let mut mac = ap(config, false);
        load(&mut mac, 1, 600);
        let err = mac.contend(SimTime::ZERO).unwrap_err();
        assert!(matches!(err, MacError::FragmentationRequired { threshold: 500, .. }));
    }

    #[test]
    fn ampdu_keeps_copies_until_block_ack() {
        let config = Dot11nConfig { enable_ampdu: true, ..Dot11nConfig::default() };
        let mut mac = ap(config, true);
        let key = load(&mut mac, 4, 200);
        let tx = mac.contend(SimTime::ZERO).unwrap().unwrap();
        let TxUnit::Ampdu(ampdu) = &tx.unit else { panic!("expected an A-MPDU") };
        assert_eq!(ampdu.num_subframes, 4);
        assert!(tx.expects_response);

        let flow = mac.output_flow(&key).unwrap();
        assert_eq!(flow.num_packets(), 4);
        assert!(flow.frames().all(|f| f.state == FrameState::AwaitingAck));
        assert_eq!((flow.win_starts, flow.win_sizes), (Some(SeqNum::ZERO), 4));

        mac.on_tx_status(SimTime::ZERO, TxStatus::Acked);
        assert_eq!(mac.stats().ampdus_sent, 1);
        let ba = BlockAck { tid: key.tid, ssn: SeqNum::ZERO, bitmap: 0b1111, no_ack: true };
        let frame = MacFrame::new(FrameKind::BlockAck, ME, PEER, build_block_ack(&ba), SimTime::ZERO);
        assert!(mac.receive_frame(SimTime::ZERO, frame).is_none());
        assert_eq!(mac.output_flow(&key).map_or(0, FlowState::num_packets), 0);
        assert_eq!(mac.stats().pkts_sent_unicast, 4);
    }

    #[test]
    fn failed_ampdu_is_rebuilt_from_the_same_frames() {
        let config = Dot11nConfig { enable_ampdu: true, ..Dot11nConfig::default() };
        let mut mac = ap(config, true);
        let key = load(&mut mac, 3, 200);
        mac.contend(SimTime::ZERO).unwrap().unwrap();
        mac.on_tx_status(SimTime::ZERO, TxStatus::Failed);
        assert!(mac.output_flow(&key).unwrap().frames().all(|f| f.state == FrameState::AwaitingAck));

        let tx = mac.contend(SimTime::ZERO).unwrap().unwrap();
        let TxUnit::Ampdu(ampdu) = &tx.unit else { panic!("expected an A-MPDU") };
        assert_eq!(ampdu.num_subframes, 3);
        assert!(mac.stats().retransmissions >= 3);
    }

    #[test]
    fn burst_session_ends_with_block_ack_request() {
        let config = Dot11nConfig { enable_data_bursting: true, ..Dot11nConfig::default() };
        let mut mac = ap(config.clone(), true);
        let mut peer = station(config);
        let key = load(&mut mac, 7, 120);
        let now = SimTime::ZERO;

        // first frame goes out alone and triggers the ADDBA exchange
        let tx = mac.contend(now).unwrap().unwrap();
        assert!(peer.receive_frame(now, mpdu(&tx).clone()).is_some());
        mac.on_tx_status(now, TxStatus::Acked);
        let request = mac.management_mut().pop().unwrap();
        assert!(peer.receive_frame(now, request.clone()).is_some());
        mac.on_management_tx_status(now, &request, true);
        let response = peer.management_mut().pop().unwrap();
        assert!(mac.receive_frame(now, response.clone()).is_some());
        peer.on_management_tx_status(now, &response, true);
        assert_eq!(mac.agreement(&key).unwrap().state(), BaaState::Idle);
        assert_eq!(mac.agreement(&key).unwrap().num_pkts_negotiated, 6);

        let mut burst = 0;
        while let Some(tx) = mac.contend(now).unwrap() {
            let frame = mpdu(&tx).clone();
            assert_eq!(frame.ack_policy, AckPolicy::BlockAck);
            assert!(!tx.expects_response);
            assert!(peer.receive_frame(now, frame).is_none());
            mac.on_tx_status(now, TxStatus::Sent);
            burst += 1;
        }
        assert_eq!(burst, 6);
        assert_eq!(mac.agreement(&key).unwrap().state(), BaaState::BlockAckRequestQueued);

        let bar = mac.management_mut().pop().unwrap();
        assert_eq!(bar.kind, FrameKind::BlockAckRequest);
        let ba = peer.receive_frame(now, bar.clone()).unwrap();
        assert_eq!(ba.kind, FrameKind::BlockAck);
        mac.on_management_tx_status(now, &bar, true);
        assert_eq!(mac.agreement(&key).unwrap().state(), BaaState::WaitBlockAck);
        assert!(mac.receive_frame(now, ba).is_none());

        assert_eq!(mac.agreement(&key).unwrap().state(), BaaState::Idle);
        assert_eq!(mac.output_flow(&key).map_or(0, FlowState::num_packets), 0);
        assert_eq!(mac.stats().pkts_sent_unicast, 7);
        assert_eq!(peer.network().delivered.len(), 7);
    }

    #[test]
    fn lost_burst_frame_is_left_to_the_block_ack() {
        let config = Dot11nConfig { enable_data_bursting: true, ..Dot11nConfig::default() };
        let mut mac = ap(config.clone(), true);
        let mut peer = station(config);
        let key = load(&mut mac, 7, 120);
        let now = SimTime::ZERO;

        let tx = mac.contend(now).unwrap().unwrap();
        peer.receive_frame(now, mpdu(&tx).clone());
        mac.on_tx_status(now, TxStatus::Acked);
        let request = mac.management_mut().pop().unwrap();
        peer.receive_frame(now, request.clone());
        mac.on_management_tx_status(now, &request, true);
        let response = peer.management_mut().pop().unwrap();
        mac.receive_frame(now, response.clone());
        peer.on_management_tx_status(now, &response, true);
        assert_eq!(mac.agreement(&key).unwrap().state(), BaaState::Idle);

        let mut seqs = Vec::new();
        while let Some(tx) = mac.contend(now).unwrap() {
            let frame = mpdu(&tx).clone();
            seqs.push(frame.seq.unwrap().value());
            if seqs.len() == 1 {
                mac.on_tx_status(now, TxStatus::Failed);
            } else {
                peer.receive_frame(now, frame);
                mac.on_tx_status(now, TxStatus::Sent);
            }
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(mac.stats().retransmissions, 0);
        assert_eq!(mac.agreement(&key).unwrap().state(), BaaState::BlockAckRequestQueued);

        let bar = mac.management_mut().pop().unwrap();
        let ba = peer.receive_frame(now, bar.clone()).unwrap();
        let (_, parsed) = parse_block_ack(&ba.body).unwrap();
        assert_eq!(parsed.ssn, SeqNum::new(1));
        assert_eq!(parsed.bitmap & 1, 0);
        mac.on_management_tx_status(now, &bar, true);
        mac.receive_frame(now, ba);
        assert!(mac.output_flow(&key).is_some_and(|f| f.num_packets() >= 1));
    }
}
