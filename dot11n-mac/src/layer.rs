#![forbid(unsafe_code)]

//! [`Dot11nMac`]: one MAC instance with its buffers, agreements and timers.
//!
//! The instance is driven entirely by its owner:
//!
//! 1. [`Dot11nMac::classify_packets`] pulls packets from the network layer into the
//!    staging and output buffers.
//! 2. [`Dot11nMac::contend`] runs EDCA and returns the next transmission; its outcome comes
//!    back through [`Dot11nMac::on_tx_status`].
//! 3. Management frames queued on the [`ManagementPlane`] report back through
//!    [`Dot11nMac::on_management_tx_status`].
//! 4. Received frames enter through [`Dot11nMac::receive_frame`] and
//!    [`Dot11nMac::receive_ampdu`].
//! 5. [`Dot11nMac::advance_to`] fires the timers that are due.
//!
//! Nothing runs in the background; given the same inputs and seed, two instances behave
//! identically.

use dot11n_core::{AccessCategory, Dot11nConfig, MacAddr, SimTime, Tid};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::ack::{parse_bar, parse_block_ack};
use crate::aggregation::{aggregate_consuming, amsdu_plan, TxBudget};
use crate::block_ack::{
    BaaState, BlockAckAgreement, BaType, ADDBA_RESPONSE_TIMEOUT, BAP_REINITIATE_TIMEOUT, BLOCK_ACK_POLICY_THRESHOLD,
    BLOCK_ACK_REQUEST_TIMEOUT,
};
use crate::buffer::{FlowKey, FlowState, InputBuffer, StagingBuffer};
use crate::capability::{HtCapabilities, NetworkRole, ProbeStatus, StationTable, IBSS_PROBE_TIMEOUT};
use crate::congestion::RetryVerdict;
use crate::errors::MacResult;
use crate::frame::{FrameKind, MacFrame};
use crate::interfaces::{ManagementPlane, NetworkLayer};
use crate::management::{build_ht_capabilities, parse_action, AddbaStatus, BlockAckAction, Delba, DelbaReason};
use crate::phy::PhyModel;
use crate::reorder;
use crate::scheduler::AcState;
use crate::stats::MacStats;
use crate::timer::{TimerEvent, TimerQueue};
use crate::tx::{action_frame, is_sendable, outbound_packets, PendingTx};

/// One 802.11n MAC.
#[derive(Debug)]
pub struct Dot11nMac<P, N, M> {
    pub(crate) addr: MacAddr,
    pub(crate) config: Dot11nConfig,
    pub(crate) phy: P,
    pub(crate) net: N,
    pub(crate) mgmt: M,
    pub(crate) acs: Vec<AcState>,
    pub(crate) staging: StagingBuffer,
    pub(crate) input: InputBuffer,
    pub(crate) stations: StationTable,
    pub(crate) timers: TimerQueue,
    pub(crate) rng: StdRng,
    pub(crate) stats: MacStats,
    /// Access category whose transmission awaits `on_tx_status`.
    pub(crate) active: Option<usize>,
    pub(crate) dialog_token: u8,
}

/// Initiator agreement of `key`, looked up in the access category that owns the TID.
pub(crate) fn initiator_mut<'a>(acs: &'a mut [AcState], key: &FlowKey) -> Option<&'a mut BlockAckAgreement> {
    acs[key.tid.access_category().index()].output.get_mut(key).and_then(|f| f.agreement.as_mut())
}

pub(crate) fn ac_index(key: &FlowKey) -> usize {
    key.tid.access_category().index()
}

impl<P: PhyModel, N: NetworkLayer, M: ManagementPlane> Dot11nMac<P, N, M> {
    pub fn new(addr: MacAddr, config: Dot11nConfig, phy: P, net: N, mgmt: M) -> MacResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.rng_seed);
        let slot = phy.slot_time();
        let acs = AccessCategory::ALL
            .iter()
            .map(|&ac| {
                let mut state = AcState::new(ac, *config.edca.get(ac), config.short_retry_limit, config.long_retry_limit);
                state.backoff = state.contention.draw_backoff(&mut rng, slot);
                state
            })
            .collect();
        info!(
            addr = %addr,
            amsdu = config.enable_amsdu,
            ampdu = config.enable_ampdu,
            bursting = config.enable_data_bursting,
            delayed_ba = config.enable_delayed_ba,
            "MAC initialised"
        );
        Ok(Self {
            addr,
            config,
            phy,
            net,
            mgmt,
            acs,
            staging: StagingBuffer::new(),
            input: InputBuffer::new(),
            stations: StationTable::new(),
            timers: TimerQueue::new(),
            rng,
            stats: MacStats::default(),
            active: None,
            dialog_token: 0,
        })
    }

    #[must_use]
    pub fn address(&self) -> MacAddr {
        self.addr
    }

    #[must_use]
    pub fn config(&self) -> &Dot11nConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    #[must_use]
    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    #[must_use]
    pub fn network(&self) -> &N {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.net
    }

    #[must_use]
    pub fn management(&self) -> &M {
        &self.mgmt
    }

    pub fn management_mut(&mut self) -> &mut M {
        &mut self.mgmt
    }

    #[must_use]
    pub fn access_category(&self, ac: AccessCategory) -> &AcState {
        &self.acs[ac.index()]
    }

    #[must_use]
    pub fn output_flow(&self, key: &FlowKey) -> Option<&FlowState> {
        self.acs[ac_index(key)].output.get(key)
    }

    #[must_use]
    pub fn staging_flow(&self, key: &FlowKey) -> Option<&FlowState> {
        self.staging.get(key)
    }

    #[must_use]
    pub fn input_flow(&self, key: &FlowKey) -> Option<&FlowState> {
        self.input.get(key)
    }

    /// Agreement in which this MAC is the initiator for `key`.
    #[must_use]
    pub fn agreement(&self, key: &FlowKey) -> Option<&BlockAckAgreement> {
        self.output_flow(key).and_then(|f| f.agreement.as_ref())
    }

    /// Agreement in which this MAC is the recipient for `key` (peer, TID).
    #[must_use]
    pub fn recipient_agreement(&self, key: &FlowKey) -> Option<&BlockAckAgreement> {
        self.input.get(key).and_then(|f| f.agreement.as_ref())
    }

    #[must_use]
    pub fn stations(&self) -> &StationTable {
        &self.stations
    }

    /// Frames queued for transmission across all access categories and the staging buffer.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.acs.iter().map(|a| a.output.total_packets()).sum::<usize>() + self.staging.total_packets()
    }

    /// Some access category can transmit now.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.acs.iter().any(AcState::has_work)
    }

    pub fn next_timer_deadline(&mut self) -> Option<SimTime> {
        self.timers.next_deadline()
    }

    /// Capabilities this MAC advertises in probe exchanges.
    #[must_use]
    pub fn local_capabilities(&self) -> HtCapabilities {
        HtCapabilities {
            max_mcs_index: self.phy.max_mcs_index(),
            big_amsdu: self.config.enable_big_amsdu,
            immediate_ba: self.config.enable_data_bursting,
            delayed_ba: self.config.enable_delayed_ba,
            rifs: self.config.rifs_mode,
            ampdu_length_exponent: self.config.ampdu_length_exponent,
        }
    }

    /// HT capabilities of `peer`, or `None` for group addresses, legacy peers and peers
    /// still being probed.
    #[must_use]
    pub fn peer_capabilities(&self, peer: MacAddr) -> Option<HtCapabilities> {
        if peer.is_group() {
            return None;
        }
        match self.mgmt.role() {
            NetworkRole::AccessPoint => self.mgmt.ap_station(peer).and_then(|r| r.ht),
            NetworkRole::Station => self.mgmt.associated_ap().filter(|r| r.addr == peer).and_then(|r| r.ht),
            NetworkRole::Ibss => self.stations.ht_capabilities(&peer),
        }
    }

    pub(crate) fn peer_uses_rifs(&self, peer: MacAddr) -> bool {
        self.config.rifs_mode && self.peer_capabilities(peer).is_some_and(|c| c.rifs)
    }

    pub(crate) fn refresh_has_packet(&mut self, ac: usize) {
        let state = &mut self.acs[ac];
        state.has_packet = state.output.peek_flow_where(|_, flow| is_sendable(flow)).is_some();
    }

    pub(crate) fn refresh_all(&mut self) {
        for ac in 0..self.acs.len() {
            self.refresh_has_packet(ac);
        }
    }

    /// Pull packets from the network layer, one per priority per pass from the highest TID
    /// down, until a pass admits nothing.
    pub fn classify_packets(&mut self, now: SimTime) {
        loop {
            let mut admitted = false;
            for tid in Tid::descending() {
                admitted |= self.classify_one(tid, now);
            }
            if !admitted {
                break;
            }
        }
        self.refresh_all();
    }

    fn classify_one(&mut self, tid: Tid, now: SimTime) -> bool {
        let Some(head) = self.net.top_packet(tid) else {
            return false;
        };
        let key = FlowKey::new(head.next_hop, tid);
        let staged = self.staging.packets_for(&key);
        if !self.acs[ac_index(&key)].output.try_reserve(&key, self.config.mac_output_queue_size, staged) {
            trace!(flow = %key, "output queue full");
            self.stats.pkts_rejected_queue_full += 1;
            return false;
        }
        let Some(packet) = self.net.dequeue_packet(tid) else {
            return false;
        };
        let key = FlowKey::new(packet.next_hop, tid);
        self.discover_peer(packet.next_hop, now);
        let frame = MacFrame::qos_data(packet.next_hop, self.addr, tid, packet.payload, now);
        if self.uses_amsdu(packet.next_hop) {
            self.staging.enqueue(key, frame, now);
            self.service_staging(key, now, false);
        } else {
            self.enqueue_output(key, frame, now);
        }
        true
    }

    fn uses_amsdu(&self, peer: MacAddr) -> bool {
        self.config.enable_amsdu && self.peer_capabilities(peer).is_some()
    }

    pub(crate) fn enqueue_output(&mut self, key: FlowKey, frame: MacFrame, now: SimTime) {
        let ac = ac_index(&key);
        self.acs[ac].output.enqueue(key, frame, now);
        self.maybe_create_agreement(key);
        self.refresh_has_packet(ac);
    }

    /// Attach an initiator agreement once more than [`BLOCK_ACK_POLICY_THRESHOLD`] frames are
    /// queued for an HT peer supporting a locally enabled agreement type.
    fn maybe_create_agreement(&mut self, key: FlowKey) {
        if key.peer.is_group() {
            return;
        }
        let Some(caps) = self.peer_capabilities(key.peer) else {
            return;
        };
        let ba_type = if self.config.enable_data_bursting && caps.immediate_ba {
            BaType::Immediate
        } else if self.config.enable_delayed_ba && caps.delayed_ba {
            BaType::Delayed
        } else {
            return;
        };
        let Some(flow) = self.acs[ac_index(&key)].output.get_mut(&key) else {
            return;
        };
        if flow.agreement.is_none() && flow.num_packets() > BLOCK_ACK_POLICY_THRESHOLD {
            debug!(flow = %key, ?ba_type, "block-ack agreement created");
            flow.agreement = Some(BlockAckAgreement::new_initiator(ba_type));
        }
    }

    /// Move staged MSDUs of `key` into the output buffer. Without `flush` at most one A-MSDU
    /// is built, and only when the output flow has nothing fresh queued; with `flush` every
    /// staged MSDU leaves, aggregated where possible.
    pub(crate) fn service_staging(&mut self, key: FlowKey, now: SimTime, flush: bool) {
        if self.staging.packets_for(&key) == 0 {
            self.cancel_staging_timer(&key);
            return;
        }
        let ac = ac_index(&key);
        let output_busy = self.acs[ac].output.get(&key).is_some_and(|f| f.fresh_count() > 0);
        if output_busy && !flush {
            self.arm_staging_timer(key, now);
            return;
        }
        let caps = self.peer_capabilities(key.peer);
        loop {
            let count = caps.and_then(|caps| {
                let budget = TxBudget::new(&self.phy, key.peer, &caps, self.acs[ac].txop_limit());
                let max_size = caps.max_amsdu_size().min(self.config.max_amsdu_size());
                self.staging.get(&key).and_then(|flow| amsdu_plan(flow, max_size, &budget))
            });
            let Some(count) = count else {
                break;
            };
            let Some(flow) = self.staging.get_mut(&key) else {
                break;
            };
            let frame = aggregate_consuming(flow, count, key.peer, self.addr, key.tid, now);
            self.stats.amsdus_created += 1;
            debug!(flow = %key, msdus = count, bytes = frame.payload_len(), "A-MSDU created");
            self.enqueue_output(key, frame, now);
            if !flush {
                break;
            }
        }
        if flush {
            while let Some(frame) = self.staging.remove_front(&key) {
                self.enqueue_output(key, frame, now);
            }
        }
        if self.staging.packets_for(&key) == 0 {
            self.cancel_staging_timer(&key);
        } else {
            self.arm_staging_timer(key, now);
        }
    }

    fn arm_staging_timer(&mut self, key: FlowKey, now: SimTime) {
        let at = now + self.config.amsdu_buffer_timeout();
        if let Some(flow) = self.staging.get_mut(&key) {
            if flow.timer.is_none() {
                flow.timer = Some(self.timers.schedule_unique(at, TimerEvent::AmsduFlush { key }));
            }
        }
    }

    fn cancel_staging_timer(&mut self, key: &FlowKey) {
        if let Some(handle) = self.staging.get_mut(key).and_then(|f| f.timer.take()) {
            self.timers.cancel(handle);
        }
    }

    /// Arm or cancel the reorder flush timer of an input flow after its queue changed.
    pub(crate) fn sync_input_timer(&mut self, key: FlowKey, now: SimTime) {
        let at = now + self.config.input_buffer_timeout();
        let Some(flow) = self.input.get_mut(&key) else {
            return;
        };
        if flow.is_empty() {
            if let Some(handle) = flow.timer.take() {
                self.timers.cancel(handle);
            }
        } else if flow.timer.is_none() {
            flow.timer = Some(self.timers.schedule_unique(at, TimerEvent::InputFlush { key }));
        }
    }

    /// Push back the inactivity deadline of the recipient agreement of `key`, replacing the
    /// timer it had.
    pub(crate) fn restart_recipient_inactivity(&mut self, key: FlowKey, now: SimTime) {
        let at = now + self.config.block_ack_policy_timeout();
        let Some(flow) = self.input.get_mut(&key) else {
            return;
        };
        let Some(generation) = flow.agreement.as_mut().map(BlockAckAgreement::arm_timer) else {
            return;
        };
        if let Some(stale) = flow.inactivity_timer.take() {
            self.timers.cancel(stale);
        }
        flow.inactivity_timer = Some(self.timers.schedule(at, TimerEvent::RecipientInactivity { key, generation }));
    }

    /// Probe a newly seen IBSS peer for its HT capabilities.
    pub(crate) fn discover_peer(&mut self, peer: MacAddr, now: SimTime) {
        if self.mgmt.role() != NetworkRole::Ibss || peer.is_group() || peer == self.addr {
            return;
        }
        if !self.stations.insert_new(peer, now) {
            return;
        }
        let body = build_ht_capabilities(&self.local_capabilities());
        let frame = MacFrame::new(FrameKind::ProbeRequest, peer, self.addr, body, now);
        if let Some(station) = self.stations.get_mut(&peer) {
            station.probe_status = ProbeStatus::RequestQueued;
        }
        debug!(peer = %peer, "probing IBSS peer");
        self.mgmt.enqueue_management_frame(frame, true);
    }

    /// Queue a DELBA for an initiator agreement.
    pub(crate) fn queue_delba(&mut self, key: FlowKey, reason: DelbaReason, now: SimTime) {
        if let Some(agreement) = initiator_mut(&mut self.acs, &key) {
            agreement.transition(&key, BaaState::DelbaQueued);
        }
        let delba = BlockAckAction::Delba(Delba { tid: key.tid, initiator: true, reason });
        info!(flow = %key, ?reason, "DELBA queued");
        let frame = action_frame(key.peer, self.addr, &delba, now);
        self.mgmt.enqueue_management_frame(frame, true);
        self.stats.delba_sent += 1;
    }

    pub(crate) fn arm_keep_alive(&mut self, key: FlowKey, now: SimTime) {
        let at = now + self.config.block_ack_policy_timeout();
        if let Some(agreement) = initiator_mut(&mut self.acs, &key) {
            let generation = agreement.arm_timer();
            self.timers.schedule(at, TimerEvent::BlockAckKeepAlive { key, generation });
        }
    }

    /// Fire every timer due at or before `now`, each at its own deadline.
    pub fn advance_to(&mut self, now: SimTime) {
        while let Some((at, _, event)) = self.timers.pop_due(now) {
            trace!(addr = %self.addr, ?event, at = %at, "timer fired");
            self.on_timer(event, at);
        }
        self.refresh_all();
    }

    fn on_timer(&mut self, event: TimerEvent, now: SimTime) {
        match event {
            TimerEvent::AddbaResponseTimeout { key, generation } => {
                let Some(agreement) = initiator_mut(&mut self.acs, &key) else { return };
                if !agreement.is_timer_current(generation) || agreement.state() != BaaState::WaitAddbaResponse {
                    return;
                }
                warn!(flow = %key, "no ADDBA response");
                agreement.starting_seq = None;
                agreement.transition(&key, BaaState::WaitRetryTimer);
                let generation = agreement.arm_timer();
                self.stats.addba_timeouts += 1;
                self.timers.schedule(now + BAP_REINITIATE_TIMEOUT, TimerEvent::BapReinitiate { key, generation });
            }
            TimerEvent::BapReinitiate { key, generation } => {
                let Some(agreement) = initiator_mut(&mut self.acs, &key) else { return };
                if agreement.is_timer_current(generation) && agreement.state() == BaaState::WaitRetryTimer {
                    agreement.transition(&key, BaaState::Disabled);
                }
            }
            TimerEvent::BlockAckKeepAlive { key, generation } => {
                let Some(flow) = self.acs[ac_index(&key)].output.get(&key) else { return };
                let Some(agreement) = flow.agreement.as_ref() else { return };
                if !agreement.is_timer_current(generation) || agreement.state() != BaaState::Idle {
                    return;
                }
                if flow.fresh_count() == 0 {
                    self.queue_delba(key, DelbaReason::Timeout, now);
                } else {
                    self.arm_keep_alive(key, now);
                }
            }
            TimerEvent::BlockAckResponseTimeout { key, generation } => {
                let Some(agreement) = initiator_mut(&mut self.acs, &key) else { return };
                if agreement.is_timer_current(generation) && agreement.state() == BaaState::WaitBlockAck {
                    warn!(flow = %key, "no block ack after BAR");
                    self.queue_delba(key, DelbaReason::Timeout, now);
                }
            }
            TimerEvent::RecipientInactivity { key, generation } => {
                let current = self
                    .recipient_agreement(&key)
                    .is_some_and(|a| a.is_timer_current(generation) && a.state() == BaaState::Receiving);
                if current {
                    info!(flow = %key, "recipient agreement inactive");
                    let delba = BlockAckAction::Delba(Delba { tid: key.tid, initiator: false, reason: DelbaReason::Timeout });
                    let frame = action_frame(key.peer, self.addr, &delba, now);
                    self.mgmt.enqueue_management_frame(frame, true);
                    self.stats.delba_sent += 1;
                    self.teardown_recipient(key, now);
                }
            }
            TimerEvent::AmsduFlush { key } => {
                if let Some(flow) = self.staging.get_mut(&key) {
                    flow.timer = None;
                }
                self.service_staging(key, now, true);
            }
            TimerEvent::InputFlush { key } => {
                let Some(flow) = self.input.get_mut(&key) else { return };
                flow.timer = None;
                let ready = reorder::flush(flow);
                debug!(flow = %key, frames = ready.len(), "reorder buffer flushed");
                for frame in ready {
                    self.deliver(frame);
                }
            }
            TimerEvent::IbssProbeTimeout { peer } => {
                if let Some(station) = self.stations.get_mut(&peer) {
                    if station.probe_status != ProbeStatus::Completed {
                        debug!(peer = %peer, "probe timed out; peer treated as non-HT");
                        station.probe_status = ProbeStatus::Completed;
                        station.probe_timer = None;
                    }
                }
            }
        }
    }

    /// Completion of a frame queued on the management plane. `acked` means the expected ACK
    /// (or BA, for an immediate BAR) arrived.
    pub fn on_management_tx_status(&mut self, now: SimTime, frame: &MacFrame, acked: bool) {
        match frame.kind {
            FrameKind::Action => match parse_action(&frame.body) {
                Ok((_, BlockAckAction::AddbaRequest(req))) => {
                    self.addba_request_sent(FlowKey::new(frame.ra, req.params.tid), acked, now);
                }
                Ok((_, BlockAckAction::AddbaResponse(resp))) => {
                    let key = FlowKey::new(frame.ra, resp.params.tid);
                    self.addba_response_sent(key, resp.status, acked, now);
                }
                Ok((_, BlockAckAction::Delba(delba))) => {
                    if delba.initiator {
                        let key = FlowKey::new(frame.ra, delba.tid);
                        self.purge_initiator_flow(ac_index(&key), key, false);
                    }
                }
                Err(err) => warn!(?err, "unparsable action frame completion"),
            },
            FrameKind::BlockAckRequest => match parse_bar(&frame.body) {
                Ok((_, bar)) => self.bar_sent(FlowKey::new(frame.ra, bar.tid), frame, acked, now),
                Err(err) => warn!(?err, "unparsable BAR completion"),
            },
            FrameKind::BlockAck => {
                if acked {
                    self.stats.ba_sent += 1;
                    if let Ok((_, ba)) = parse_block_ack(&frame.body) {
                        let key = FlowKey::new(frame.ra, ba.tid);
                        if let Some(agreement) = self.input.get_mut(&key).and_then(|f| f.agreement.as_mut()) {
                            agreement.block_ack_sent = true;
                        }
                    }
                }
            }
            FrameKind::ProbeRequest => self.probe_request_sent(frame.ra, acked, now),
            _ => {}
        }
        self.refresh_all();
    }

    fn addba_request_sent(&mut self, key: FlowKey, acked: bool, now: SimTime) {
        let Some(agreement) = initiator_mut(&mut self.acs, &key) else { return };
        if agreement.state() != BaaState::AddbaRequestQueued {
            return;
        }
        if acked {
            agreement.transition(&key, BaaState::WaitAddbaResponse);
            let generation = agreement.arm_timer();
            self.timers.schedule(now + ADDBA_RESPONSE_TIMEOUT, TimerEvent::AddbaResponseTimeout { key, generation });
        } else {
            agreement.starting_seq = None;
            agreement.transition(&key, BaaState::WaitRetryTimer);
            let generation = agreement.arm_timer();
            self.timers.schedule(now + BAP_REINITIATE_TIMEOUT, TimerEvent::BapReinitiate { key, generation });
        }
    }

    fn addba_response_sent(&mut self, key: FlowKey, status: AddbaStatus, acked: bool, now: SimTime) {
        let Some(flow) = self.input.get_mut(&key) else { return };
        let Some(agreement) = flow.agreement.as_mut() else { return };
        if agreement.state() != BaaState::ReceiverWaitBaSetup {
            return;
        }
        if acked && status == AddbaStatus::Success {
            agreement.transition(&key, BaaState::Receiving);
            self.restart_recipient_inactivity(key, now);
            info!(flow = %key, "recipient agreement established");
        } else {
            flow.agreement = None;
            flow.reset_rx_window();
            debug!(flow = %key, "recipient agreement abandoned");
        }
    }

    fn bar_sent(&mut self, key: FlowKey, frame: &MacFrame, acked: bool, now: SimTime) {
        let ac = ac_index(&key);
        let Some(agreement) = initiator_mut(&mut self.acs, &key) else { return };
        if agreement.state() != BaaState::BlockAckRequestQueued {
            return;
        }
        if acked {
            agreement.transition(&key, BaaState::WaitBlockAck);
            let generation = agreement.arm_timer();
            self.timers.schedule(now + BLOCK_ACK_REQUEST_TIMEOUT, TimerEvent::BlockAckResponseTimeout { key, generation });
            self.stats.bar_sent += 1;
            return;
        }
        match self.acs[ac].contention.on_failure(frame.len(), self.config.rts_threshold) {
            RetryVerdict::Retry => {
                trace!(flow = %key, "BAR retried");
                self.mgmt.enqueue_management_frame(frame.clone(), true);
            }
            RetryVerdict::Drop => self.abort_burst(ac, key),
        }
    }

    fn probe_request_sent(&mut self, peer: MacAddr, acked: bool, now: SimTime) {
        let Some(station) = self.stations.get_mut(&peer) else { return };
        if station.probe_status != ProbeStatus::RequestQueued {
            return;
        }
        if acked {
            station.probe_status = ProbeStatus::InProgress;
            station.probe_timer = Some(self.timers.schedule(now + IBSS_PROBE_TIMEOUT, TimerEvent::IbssProbeTimeout { peer }));
        } else {
            station.probe_status = ProbeStatus::Completed;
            debug!(peer = %peer, "probe unanswered; peer treated as non-HT");
        }
    }

    /// Drop all queued state. With `notify`, every queued MSDU is reported to the network
    /// layer as dropped.
    pub fn reset(&mut self, notify: bool) {
        let mut dropped = Vec::new();
        for ac in &mut self.acs {
            if let Some(PendingTx::Single { frame, .. }) = ac.pending.take() {
                dropped.push(frame);
            }
            dropped.extend(ac.output.clear().into_iter().map(|(_, frame)| frame));
            ac.txop_continuation = None;
            ac.has_packet = false;
            ac.contention.on_success();
        }
        dropped.extend(self.staging.clear().into_iter().map(|(_, frame)| frame));
        self.input.clear();
        self.timers.clear();
        self.stations.clear();
        self.active = None;
        info!(addr = %self.addr, frames = dropped.len(), "MAC reset");
        if notify {
            for frame in dropped {
                for packet in outbound_packets(&frame) {
                    self.net.packet_dropped(packet);
                }
            }
        }
    }
}
