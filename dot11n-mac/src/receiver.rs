#![forbid(unsafe_code)]

//! Receive side of [`Dot11nMac`]: data delivery through the reorder buffer, the recipient
//! half of block-ack agreements, and the answers the MAC owes its peers.
//!
//! Control responses that follow after SIFS (ACK, immediate BA) are returned to the caller;
//! everything else is queued on the management plane.

use dot11n_core::{MacAddr, SimTime};
use tracing::{debug, info, trace, warn};

use crate::ack::{build_block_ack, parse_bar, parse_block_ack, BlockAck, BLOCK_ACK_WINDOW};
use crate::ampdu::{parse_ampdu, AmpduFrame, SubframeErrorModel};
use crate::amsdu::parse_amsdu;
use crate::block_ack::{
    advance_rx_window, apply_block_ack, open_rx_window, record_rx, BaType, BaaState, BlockAckAgreement,
    RxScoreboard, BAP_REINITIATE_TIMEOUT, MAX_MPDUS_NEGOTIATED_VIA_BA_POLICY,
};
use crate::buffer::FlowKey;
use crate::capability::{NetworkRole, ProbeStatus};
use crate::frame::{parse_mpdu_header, AckPolicy, FrameKind, MacFrame};
use crate::interfaces::{ManagementPlane, NetworkLayer};
use crate::layer::{ac_index, initiator_mut, Dot11nMac};
use crate::management::{
    build_ht_capabilities, parse_action, parse_ht_capabilities, AddbaRequest, AddbaResponse, AddbaStatus,
    BaParameters, BlockAckAction, Delba,
};
use crate::phy::PhyModel;
use crate::reorder;
use crate::timer::TimerEvent;
use crate::tx::{action_frame, control_frame};

impl<P: PhyModel, N: NetworkLayer, M: ManagementPlane> Dot11nMac<P, N, M> {
    /// Process one received MPDU. Returns the control response due after SIFS, if any.
    pub fn receive_frame(&mut self, now: SimTime, frame: MacFrame) -> Option<MacFrame> {
        if frame.ra != self.addr && !frame.ra.is_group() {
            return None;
        }
        let peer = frame.ta;
        let unicast = !frame.ra.is_group();
        let ack = |me: MacAddr| control_frame(FrameKind::Ack, peer, me, now);
        let response = match frame.kind {
            FrameKind::Data | FrameKind::QosData => {
                let wants_ack = unicast && frame.ack_policy == AckPolicy::Normal;
                self.discover_peer(peer, now);
                self.receive_data(now, frame);
                wants_ack.then(|| ack(self.addr))
            }
            FrameKind::BlockAck => self.receive_block_ack(now, &frame).then(|| ack(self.addr)),
            FrameKind::BlockAckRequest => self.receive_block_ack_request(now, &frame),
            FrameKind::Action => {
                self.receive_action(now, &frame);
                unicast.then(|| ack(self.addr))
            }
            FrameKind::ProbeRequest => {
                self.receive_probe_request(now, &frame);
                unicast.then(|| ack(self.addr))
            }
            FrameKind::ProbeResponse => {
                self.receive_probe_response(&frame);
                unicast.then(|| ack(self.addr))
            }
            FrameKind::Rts | FrameKind::Cts | FrameKind::Ack => None,
        };
        self.refresh_all();
        response
    }

    /// Process a received A-MPDU. `model` decides which sub-frames were damaged; the intact
    /// ones are delivered and acknowledged in one compressed block ack, returned for
    /// transmission after SIFS. Nothing is returned when every sub-frame was lost.
    pub fn receive_ampdu(
        &mut self,
        now: SimTime,
        ampdu: &AmpduFrame,
        snr_db: f64,
        model: &mut dyn SubframeErrorModel,
    ) -> Option<MacFrame> {
        if ampdu.ra != self.addr {
            return None;
        }
        self.stats.ampdus_received += 1;
        let ber = self.phy.bit_error_rate(snr_db, ampdu.mcs);
        let mut first = None;
        let mut bitmap = 0u64;
        let mut intact = Vec::new();
        for raw in parse_ampdu(&ampdu.payload) {
            let corrupted = model.is_corrupted(snr_db, raw.len() * 8, ber);
            let header = parse_mpdu_header(&raw).map(|(rest, hdr)| (raw.len() - rest.len(), hdr));
            let Ok((header_len, hdr)) = header else {
                self.stats.subframes_corrupted += 1;
                continue;
            };
            let frame = MacFrame::from_header(hdr, raw.slice(header_len..), now);
            let Some(seq) = frame.seq else { continue };
            let base = *first.get_or_insert(seq);
            if corrupted {
                self.stats.subframes_corrupted += 1;
                continue;
            }
            let pos = base.distance_to(seq);
            if pos < BLOCK_ACK_WINDOW {
                bitmap |= 1u64 << pos;
            }
            intact.push(frame);
        }
        let ssn = first?;
        trace!(
            addr = %self.addr,
            subframes = ampdu.num_subframes,
            intact = intact.len(),
            "A-MPDU received"
        );
        self.discover_peer(ampdu.ta, now);
        let key = FlowKey::new(ampdu.ta, ampdu.tid);
        if self.input.get(&key).is_none() {
            // a damaged head sub-frame must not move the reorder start past itself
            self.input.get_or_create(key, now).seed_sequence(ssn);
        }
        for frame in intact {
            self.receive_data(now, frame);
        }
        self.refresh_all();
        if bitmap == 0 {
            return None;
        }
        self.stats.ba_sent += 1;
        let ba = BlockAck { tid: ampdu.tid, ssn, bitmap, no_ack: true };
        Some(MacFrame::new(FrameKind::BlockAck, ampdu.ta, self.addr, build_block_ack(&ba), now))
    }

    /// Per-MPDU receive path: group frames go straight up, unicast QoS data passes the
    /// recipient scoreboard and the reorder buffer.
    pub(crate) fn receive_data(&mut self, now: SimTime, frame: MacFrame) {
        let (Some(tid), Some(seq)) = (frame.tid, frame.seq) else {
            self.deliver(frame);
            return;
        };
        if frame.is_group() {
            self.deliver(frame);
            return;
        }
        let key = FlowKey::new(frame.ta, tid);
        let known = self.input.get(&key).is_some();
        let flow = self.input.get_or_create(key, now);
        if !known {
            flow.seed_sequence(seq);
        }
        let state = flow.agreement.as_ref().map(BlockAckAgreement::state);
        if matches!(state, Some(BaaState::Receiving | BaaState::ReceiverWaitBaSetup)) {
            if record_rx(flow, seq) == RxScoreboard::OutOfRange {
                self.stats.seq_mismatch_drops += 1;
                debug!(flow = %key, seq = seq.value(), "sequence outside the recipient window");
                return;
            }
        }
        let ready = reorder::push(flow, frame, now);
        if state == Some(BaaState::Receiving) {
            self.restart_recipient_inactivity(key, now);
        }
        self.sync_input_timer(key, now);
        match ready {
            Some(frames) => {
                for frame in frames {
                    self.deliver(frame);
                }
            }
            None => {
                self.stats.duplicate_drops += 1;
                trace!(flow = %key, seq = seq.value(), "duplicate dropped");
            }
        }
    }

    /// Hand a frame's MSDUs to the network layer, unpacking A-MSDUs.
    pub(crate) fn deliver(&mut self, frame: MacFrame) {
        let source = frame.ta;
        if !frame.is_amsdu {
            self.stats.pkts_received += 1;
            self.net.hand_off(frame.body, source);
            return;
        }
        match parse_amsdu(&frame.body) {
            Ok(subframes) => {
                self.stats.amsdus_received += 1;
                for subframe in subframes {
                    self.stats.pkts_received += 1;
                    self.net.hand_off(subframe.msdu, source);
                }
            }
            Err(err) => warn!(from = %source, ?err, "malformed A-MSDU dropped"),
        }
    }

    /// Block ack for one of our windows. Returns whether the BA itself must be acknowledged.
    fn receive_block_ack(&mut self, now: SimTime, frame: &MacFrame) -> bool {
        let Ok((_, ba)) = parse_block_ack(&frame.body) else {
            warn!(from = %frame.ta, "malformed block ack");
            return false;
        };
        self.stats.ba_received += 1;
        let key = FlowKey::new(frame.ta, ba.tid);
        let ac = ac_index(&key);
        let Some(flow) = self.acs[ac].output.get_mut(&key) else {
            return !ba.no_ack;
        };
        let burst = flow.agreement.as_ref().is_some_and(|a| a.state() == BaaState::WaitBlockAck);
        if !burst && flow.win_starts.is_none() {
            debug!(flow = %key, "unsolicited block ack ignored");
            return !ba.no_ack;
        }
        let Some(update) = apply_block_ack(flow, ba.ssn, ba.bitmap) else {
            debug!(flow = %key, ssn = ba.ssn.value(), "block ack for another window ignored");
            return !ba.no_ack;
        };
        if burst {
            flow.reset_tx_window();
            if let Some(agreement) = flow.agreement.as_mut() {
                agreement.reset_session();
                agreement.transition(&key, BaaState::Idle);
            }
        } else if flow.win_sizes == 0 {
            flow.win_starts = None;
        }
        let freed = update.freed.len();
        self.stats.pkts_sent_unicast += freed as u64;
        debug!(flow = %key, freed, retained = update.retained_acked, "block ack applied");
        if burst {
            self.arm_keep_alive(key, now);
        }
        self.service_staging(key, now, false);
        !ba.no_ack
    }

    /// Answer a BAR: immediately with a BA, or with an ACK now and a BA later for delayed
    /// agreements. Without an agreement the BAR is just acknowledged.
    fn receive_block_ack_request(&mut self, now: SimTime, frame: &MacFrame) -> Option<MacFrame> {
        let ack = control_frame(FrameKind::Ack, frame.ta, self.addr, now);
        let Ok((_, bar)) = parse_bar(&frame.body) else {
            warn!(from = %frame.ta, "malformed BAR");
            return None;
        };
        let key = FlowKey::new(frame.ta, bar.tid);
        let Some(flow) = self.input.get_mut(&key) else {
            return Some(ack);
        };
        let Some(ba_type) = flow
            .agreement
            .as_ref()
            .filter(|a| matches!(a.state(), BaaState::Receiving | BaaState::ReceiverWaitBaSetup))
            .map(|a| a.ba_type)
        else {
            return Some(ack);
        };
        advance_rx_window(flow, bar.ssn);
        let ready = reorder::advance_to(flow, bar.ssn);
        let ba = BlockAck {
            tid: bar.tid,
            ssn: flow.win_startr.unwrap_or(bar.ssn),
            bitmap: flow.ba_bitmap,
            no_ack: ba_type == BaType::Immediate,
        };
        if ba_type == BaType::Delayed {
            if let Some(agreement) = flow.agreement.as_mut() {
                agreement.block_ack_sent = false;
            }
        }
        self.sync_input_timer(key, now);
        for frame in ready {
            self.deliver(frame);
        }
        let response = MacFrame::new(FrameKind::BlockAck, frame.ta, self.addr, build_block_ack(&ba), now);
        debug!(flow = %key, ssn = ba.ssn.value(), bitmap = format_args!("{:#x}", ba.bitmap), "answering BAR");
        match ba_type {
            BaType::Immediate => {
                self.stats.ba_sent += 1;
                Some(response)
            }
            BaType::Delayed => {
                self.mgmt.enqueue_management_frame(response, true);
                Some(ack)
            }
        }
    }

    fn receive_action(&mut self, now: SimTime, frame: &MacFrame) {
        match parse_action(&frame.body) {
            Ok((_, BlockAckAction::AddbaRequest(req))) => self.receive_addba_request(now, frame.ta, req),
            Ok((_, BlockAckAction::AddbaResponse(resp))) => self.receive_addba_response(now, frame.ta, resp),
            Ok((_, BlockAckAction::Delba(delba))) => self.receive_delba(now, frame.ta, delba),
            Err(err) => warn!(from = %frame.ta, ?err, "malformed action frame"),
        }
    }

    fn receive_addba_request(&mut self, now: SimTime, peer: MacAddr, req: AddbaRequest) {
        let key = FlowKey::new(peer, req.params.tid);
        let accept = match req.params.ba_type {
            BaType::Immediate => self.config.enable_data_bursting,
            BaType::Delayed => self.config.enable_delayed_ba,
        };
        let buffer = req.params.buffer_size.clamp(1, MAX_MPDUS_NEGOTIATED_VIA_BA_POLICY);
        let known = self.input.get(&key).is_some();
        let flow = self.input.get_or_create(key, now);
        if !known {
            flow.seed_sequence(req.ssn);
        }
        let mut ready = Vec::new();
        if accept {
            ready = reorder::advance_to(flow, req.ssn);
            open_rx_window(flow, req.ssn, buffer);
            flow.agreement = Some(BlockAckAgreement::new_recipient(req.params.ba_type, req.dialog_token, buffer, req.ssn));
        }
        let response = AddbaResponse {
            dialog_token: req.dialog_token,
            status: if accept { AddbaStatus::Success } else { AddbaStatus::Failure },
            params: BaParameters { buffer_size: if accept { buffer } else { 0 }, ..req.params },
            timeout_tu: req.timeout_tu,
        };
        info!(flow = %key, accept, buffer, ssn = req.ssn.value(), "ADDBA request");
        let frame = action_frame(peer, self.addr, &BlockAckAction::AddbaResponse(response), now);
        self.mgmt.enqueue_management_frame(frame, true);
        self.sync_input_timer(key, now);
        for frame in ready {
            self.deliver(frame);
        }
    }

    fn receive_addba_response(&mut self, now: SimTime, peer: MacAddr, resp: AddbaResponse) {
        let key = FlowKey::new(peer, resp.params.tid);
        let keep_alive = now + self.config.block_ack_policy_timeout();
        let Some(agreement) = initiator_mut(&mut self.acs, &key) else {
            return;
        };
        if agreement.state() != BaaState::WaitAddbaResponse {
            trace!(flow = %key, "stray ADDBA response");
            return;
        }
        if resp.status == AddbaStatus::Success && resp.dialog_token == agreement.dialog_token {
            agreement.num_pkts_negotiated = agreement.num_pkts_negotiated.min(resp.params.buffer_size).max(1);
            agreement.transition(&key, BaaState::Idle);
            let generation = agreement.arm_timer();
            info!(flow = %key, buffer = agreement.num_pkts_negotiated, "block-ack agreement established");
            self.timers.schedule(keep_alive, TimerEvent::BlockAckKeepAlive { key, generation });
            self.stats.ba_agreements_established += 1;
        } else {
            agreement.starting_seq = None;
            agreement.transition(&key, BaaState::WaitRetryTimer);
            let generation = agreement.arm_timer();
            info!(flow = %key, "block-ack agreement refused");
            self.timers.schedule(now + BAP_REINITIATE_TIMEOUT, TimerEvent::BapReinitiate { key, generation });
            self.stats.ba_agreements_rejected += 1;
        }
    }

    fn receive_delba(&mut self, now: SimTime, peer: MacAddr, delba: Delba) {
        let key = FlowKey::new(peer, delba.tid);
        self.stats.delba_received += 1;
        info!(flow = %key, initiator = delba.initiator, reason = ?delba.reason, "DELBA received");
        if delba.initiator {
            self.teardown_recipient(key, now);
        } else {
            self.purge_initiator_flow(ac_index(&key), key, true);
        }
    }

    /// Drop the recipient agreement of `key` and release everything it was holding.
    pub(crate) fn teardown_recipient(&mut self, key: FlowKey, now: SimTime) {
        let Some(flow) = self.input.get_mut(&key) else {
            return;
        };
        flow.agreement = None;
        flow.reset_rx_window();
        if let Some(handle) = flow.inactivity_timer.take() {
            self.timers.cancel(handle);
        }
        let ready = reorder::flush(flow);
        self.sync_input_timer(key, now);
        for frame in ready {
            self.deliver(frame);
        }
    }

    fn receive_probe_request(&mut self, now: SimTime, frame: &MacFrame) {
        if self.mgmt.role() == NetworkRole::Ibss {
            if let Ok((_, ht)) = parse_ht_capabilities(&frame.body) {
                self.stations.insert_new(frame.ta, now);
                if let Some(station) = self.stations.get_mut(&frame.ta) {
                    if station.probe_status == ProbeStatus::None {
                        station.ht = ht;
                        station.probe_status = ProbeStatus::Completed;
                    }
                }
            }
        }
        let body = build_ht_capabilities(&self.local_capabilities());
        let response = MacFrame::new(FrameKind::ProbeResponse, frame.ta, self.addr, body, now);
        self.mgmt.enqueue_management_frame(response, true);
    }

    fn receive_probe_response(&mut self, frame: &MacFrame) {
        if self.mgmt.role() != NetworkRole::Ibss {
            return;
        }
        let ht = match parse_ht_capabilities(&frame.body) {
            Ok((_, ht)) => ht,
            Err(err) => {
                warn!(from = %frame.ta, ?err, "malformed probe response");
                None
            }
        };
        let Some(station) = self.stations.get_mut(&frame.ta) else {
            return;
        };
        if let Some(handle) = station.probe_timer.take() {
            self.timers.cancel(handle);
        }
        station.ht = ht;
        station.probe_status = ProbeStatus::Completed;
        debug!(peer = %frame.ta, ht = ht.is_some(), "probe response");
    }
}
