#![forbid(unsafe_code)]

//! Two-station link simulator for exercising the 802.11n MAC end to end.
//!
//! [`LinkSimulator`] owns two [`Dot11nMac`] instances wired to in-memory network and
//! management collaborators and plays the medium between them: it grants the air to one
//! station at a time, loses frames according to a [`ChannelModel`], and feeds the ACK or block
//! ack a receiver produces back to the transmitter after its transmit status. Management frames
//! queued by either side are exchanged ahead of data, one per step. Time only moves forward,
//! either by the duration of what went on air or by jumping to the next pending timer.

use std::time::Duration;

use bytes::Bytes;
use dot11n_core::{Dot11nConfig, MacAddr, SimTime, Tid};
use dot11n_mac::testing::{MockManagement, MockNetwork, ScriptedErrors};
use dot11n_mac::{
    AckPolicy, BerErrorModel, Dot11nMac, FrameKind, HtPhy, MacFrame, MacResult, PeerRecord, PhyModel,
    Transmission, TxStatus, TxUnit,
};
use dot11n_telemetry::{create_span, MacMetrics};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub type SimMac = Dot11nMac<HtPhy, MockNetwork, MockManagement>;

/// Address of the first station (the access point in infrastructure mode).
pub const NODE_A: MacAddr = MacAddr::from_node(1);
pub const NODE_B: MacAddr = MacAddr::from_node(2);

/// Medium between the two stations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelModel {
    /// Probability that any single transmission, response included, is lost.
    pub loss_rate: f64,
    /// Signal-to-noise ratio seen by A-MPDU sub-frames.
    pub snr_db: f64,
    pub seed: u64,
}

impl Default for ChannelModel {
    fn default() -> Self {
        Self { loss_rate: 0.0, snr_db: 40.0, seed: 7 }
    }
}

impl ChannelModel {
    #[must_use]
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self { loss_rate, seed, ..Self::default() }
    }
}

/// One transmission as observed on the medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirRecord {
    pub at: SimTime,
    /// Index of the transmitting station.
    pub from: usize,
    pub kind: FrameKind,
    /// Sub-frames for an A-MPDU, 1 otherwise.
    pub subframes: usize,
    pub delivered: bool,
}

pub struct LinkSimulator {
    macs: [SimMac; 2],
    channel: ChannelModel,
    rng: StdRng,
    subframe_errors: Option<ScriptedErrors>,
    now: SimTime,
    turn: usize,
    air: Vec<AirRecord>,
}

impl std::fmt::Debug for LinkSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSimulator")
            .field("now", &self.now)
            .field("channel", &self.channel)
            .field("transmissions", &self.air.len())
            .finish()
    }
}

impl LinkSimulator {
    /// Wire two already-built stations together.
    #[must_use]
    pub fn new(a: SimMac, b: SimMac, channel: ChannelModel) -> Self {
        let rng = StdRng::seed_from_u64(channel.seed);
        Self { macs: [a, b], channel, rng, subframe_errors: None, now: SimTime::ZERO, turn: 0, air: Vec::new() }
    }

    /// Access point [`NODE_A`] with station [`NODE_B`] associated to it. Each side learns the
    /// other's HT capabilities from its configuration.
    pub fn infrastructure(ap: Dot11nConfig, sta: Dot11nConfig, channel: ChannelModel) -> MacResult<Self> {
        let mut ap = Dot11nMac::new(NODE_A, ap, HtPhy::default(), MockNetwork::new(), MockManagement::access_point())?;
        let ap_record = PeerRecord { addr: NODE_A, ht: Some(ap.local_capabilities()) };
        let sta = Dot11nMac::new(NODE_B, sta, HtPhy::default(), MockNetwork::new(), MockManagement::station(ap_record))?;
        ap.management_mut()
            .insert_peer(PeerRecord { addr: NODE_B, ht: Some(sta.local_capabilities()) });
        Ok(Self::new(ap, sta, channel))
    }

    /// Two IBSS stations that discover each other by probing.
    pub fn ibss(a: Dot11nConfig, b: Dot11nConfig, channel: ChannelModel) -> MacResult<Self> {
        let a = Dot11nMac::new(NODE_A, a, HtPhy::default(), MockNetwork::new(), MockManagement::ibss())?;
        let b = Dot11nMac::new(NODE_B, b, HtPhy::default(), MockNetwork::new(), MockManagement::ibss())?;
        Ok(Self::new(a, b, channel))
    }

    /// Damage A-MPDU sub-frames at the given positions, counted across every A-MPDU of the
    /// run, instead of drawing bit errors.
    #[must_use]
    pub fn with_subframe_errors(mut self, errors: ScriptedErrors) -> Self {
        self.subframe_errors = Some(errors);
        self
    }

    #[must_use]
    pub fn now(&self) -> SimTime {
        self.now
    }

    #[must_use]
    pub fn mac(&self, index: usize) -> &SimMac {
        &self.macs[index]
    }

    pub fn mac_mut(&mut self, index: usize) -> &mut SimMac {
        &mut self.macs[index]
    }

    /// Everything sent on the medium so far.
    #[must_use]
    pub fn air_log(&self) -> &[AirRecord] {
        &self.air
    }

    /// Queue an MSDU at station `from` for the other station.
    pub fn push(&mut self, from: usize, tid: Tid, payload: impl Into<Bytes>) {
        let to = self.macs[1 - from].address();
        self.macs[from].network_mut().push(to, tid, payload);
    }

    /// MSDUs station `index` handed to its network layer.
    #[must_use]
    pub fn delivered(&self, index: usize) -> usize {
        self.macs[index].network().delivered.len()
    }

    /// Advance by one event. Returns `false` once neither station has anything left to send
    /// and no timer is pending.
    pub fn step(&mut self) -> MacResult<bool> {
        let now = self.now;
        for mac in &mut self.macs {
            mac.advance_to(now);
            mac.classify_packets(now);
        }
        if self.exchange_management() {
            return Ok(true);
        }
        for offset in 0..self.macs.len() {
            let index = (self.turn + offset) % self.macs.len();
            if let Some(tx) = self.macs[index].contend(now)? {
                // a station inside its TXOP keeps the medium
                let bursting = matches!(&tx.unit, TxUnit::Mpdu(f) if f.ack_policy == AckPolicy::BlockAck);
                self.turn = if bursting { index } else { 1 - index };
                self.transmit(index, tx);
                return Ok(true);
            }
        }
        let next = self.macs.iter_mut().filter_map(SimMac::next_timer_deadline).min();
        match next {
            Some(at) => {
                trace!(from = %now, to = %at, "medium idle until next timer");
                self.now = self.now.max(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Step until idle or `max_steps` events have run. Returns the number of steps taken.
    pub fn run_until_idle(&mut self, max_steps: usize) -> MacResult<usize> {
        let span = create_span("link", "run_until_idle");
        let _enter = span.enter();
        let mut steps = 0;
        while steps < max_steps && self.step()? {
            steps += 1;
        }
        debug!(steps, now = %self.now, "link run finished");
        Ok(steps)
    }

    /// Step until simulated time reaches `deadline` or the link goes idle.
    pub fn run_until(&mut self, deadline: SimTime) -> MacResult<()> {
        while self.now < deadline && self.step()? {}
        Ok(())
    }

    /// Snapshot both stations' counters into `metrics` under labels `a` and `b`.
    pub fn export_metrics(&self, metrics: &MacMetrics) {
        metrics.observe("a", self.macs[0].stats());
        metrics.observe("b", self.macs[1].stats());
    }

    fn delivers(&mut self) -> bool {
        self.channel.loss_rate <= 0.0 || self.rng.gen::<f64>() >= self.channel.loss_rate
    }

    fn control_airtime(&self, from: usize, kind: FrameKind, len: usize) -> Duration {
        let mac = &self.macs[from];
        mac.phy().sifs() + mac.phy().transmission_duration(len, kind, mac.address(), None)
    }

    fn record(&mut self, from: usize, kind: FrameKind, subframes: usize, delivered: bool) {
        self.air.push(AirRecord { at: self.now, from, kind, subframes, delivered });
    }

    fn transmit(&mut self, from: usize, tx: Transmission) {
        let to = 1 - from;
        let mut at = self.now + tx.access_delay;
        if tx.use_rts {
            at += self.control_airtime(from, FrameKind::Rts, 20) + self.control_airtime(to, FrameKind::Cts, 14);
            at += self.macs[from].phy().sifs();
        }
        at += tx.airtime;
        self.now = at;
        let delivered = self.delivers();
        match tx.unit {
            TxUnit::Mpdu(frame) => {
                let kind = frame.kind;
                self.record(from, kind, 1, delivered);
                let response = if delivered { self.macs[to].receive_frame(at, frame) } else { None };
                let response = response.filter(|_| self.delivers());
                let status = match (tx.expects_response, &response) {
                    (false, _) => TxStatus::Sent,
                    (true, Some(_)) => TxStatus::Acked,
                    (true, None) => TxStatus::Failed,
                };
                if let Some(r) = &response {
                    self.now += self.control_airtime(to, r.kind, r.len());
                }
                trace!(from, ?kind, ?status, "MPDU exchanged");
                self.macs[from].on_tx_status(self.now, status);
                if let Some(r) = response.filter(|r| r.kind == FrameKind::BlockAck) {
                    let _ = self.macs[from].receive_frame(self.now, r);
                }
            }
            TxUnit::Ampdu(ampdu) => {
                self.record(from, FrameKind::QosData, ampdu.num_subframes, delivered);
                let snr = self.channel.snr_db;
                let ba = if !delivered {
                    None
                } else if let Some(errors) = self.subframe_errors.as_mut() {
                    self.macs[to].receive_ampdu(at, &ampdu, snr, errors)
                } else {
                    let mut model = BerErrorModel::new(&mut self.rng);
                    self.macs[to].receive_ampdu(at, &ampdu, snr, &mut model)
                };
                let ba = ba.filter(|_| self.delivers());
                let status = if ba.is_some() { TxStatus::Acked } else { TxStatus::Failed };
                if let Some(ba) = &ba {
                    self.now += self.control_airtime(to, FrameKind::BlockAck, ba.len());
                }
                trace!(from, subframes = ampdu.num_subframes, ?status, "A-MPDU exchanged");
                self.macs[from].on_tx_status(self.now, status);
                if let Some(ba) = ba {
                    let _ = self.macs[from].receive_frame(self.now, ba);
                }
            }
        }
    }

    /// Send the oldest queued management frame of either station. Returns whether one went out.
    fn exchange_management(&mut self) -> bool {
        let Some((from, frame)) = (0..self.macs.len())
            .find_map(|i| self.macs[i].management_mut().pop().map(|frame| (i, frame)))
        else {
            return false;
        };
        let to = 1 - from;
        let phy = self.macs[from].phy();
        let access = phy.sifs() + 2 * phy.slot_time();
        self.now += access + phy.transmission_duration(frame.len(), frame.kind, frame.ra, None);
        let delivered = self.delivers();
        self.record(from, frame.kind, 1, delivered);
        let response: Option<MacFrame> = if delivered { self.macs[to].receive_frame(self.now, frame.clone()) } else { None };
        let response = response.filter(|_| self.delivers());
        if let Some(r) = &response {
            self.now += self.control_airtime(to, r.kind, r.len());
        }
        let acked = response.is_some();
        debug!(from, kind = ?frame.kind, acked, "management frame exchanged");
        self.macs[from].on_management_tx_status(self.now, &frame, acked);
        if let Some(r) = response.filter(|r| r.kind == FrameKind::BlockAck) {
            let _ = self.macs[from].receive_frame(self.now, r);
        }
        true
    }
}
