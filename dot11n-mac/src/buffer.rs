#![forbid(unsafe_code)]

//! Keyed flow store shared by the output, A-MSDU staging and input buffers.
//!
//! Each buffer maps a [`FlowKey`] (peer, TID) to a [`FlowState`]. The three instantiations
//! differ only in their [`BufferPolicy`]:
//!
//! * output: FIFO, assigns the next sequence number on enqueue;
//! * staging: FIFO, no sequence numbers (one is assigned when the A-MSDU is built);
//! * input: insertion-sorted by sequence number relative to the next expected one.
//!
//! Flows are never removed while the MAC runs; an empty flow keeps its block-ack agreement.

use dot11n_core::{MacAddr, SimTime, Tid};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::trace;

use crate::block_ack::BlockAckAgreement;
use crate::frame::{FrameState, MacFrame};
use crate::sequencer::SeqNum;
use crate::timer::TimerHandle;

/// (peer, TID) pair identifying one flow within a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub peer: MacAddr,
    pub tid: Tid,
}

impl FlowKey {
    #[must_use]
    pub fn new(peer: MacAddr, tid: Tid) -> Self {
        Self { peer, tid }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.tid)
    }
}

/// Per-flow queue, windows and agreement.
#[derive(Debug)]
pub struct FlowState {
    queue: VecDeque<MacFrame>,
    num_packets: usize,
    agg_size: usize,
    /// Next sequence number to assign (output) or to deliver (input).
    pub seq_num: SeqNum,
    /// Transmit window: first unacknowledged sequence number, `None` when no window is open.
    pub win_starts: Option<SeqNum>,
    pub win_sizes: u16,
    /// Receive scoreboard window.
    pub win_startr: Option<SeqNum>,
    pub win_sizer: u16,
    pub ba_bitmap: u64,
    pub agreement: Option<BlockAckAgreement>,
    pub timer: Option<TimerHandle>,
    /// Inactivity timer of the recipient agreement.
    pub inactivity_timer: Option<TimerHandle>,
    pub created_at: SimTime,
}

impl FlowState {
    #[must_use]
    pub fn new(now: SimTime) -> Self {
        Self {
            queue: VecDeque::new(),
            num_packets: 0,
            agg_size: 0,
            seq_num: SeqNum::ZERO,
            win_starts: None,
            win_sizes: 0,
            win_startr: None,
            win_sizer: 0,
            ba_bitmap: 0,
            agreement: None,
            timer: None,
            inactivity_timer: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn num_packets(&self) -> usize {
        self.num_packets
    }

    /// Sum of the payload lengths of queued frames.
    #[must_use]
    pub fn agg_size(&self) -> usize {
        self.agg_size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_packets == 0
    }

    pub fn frames(&self) -> impl Iterator<Item = &MacFrame> {
        self.queue.iter()
    }

    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut MacFrame> {
        self.queue.iter_mut()
    }

    #[must_use]
    pub fn front(&self) -> Option<&MacFrame> {
        self.queue.front()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&MacFrame> {
        self.queue.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MacFrame> {
        self.queue.get_mut(index)
    }

    #[must_use]
    pub fn position_of(&self, seq: SeqNum) -> Option<usize> {
        self.queue.iter().position(|f| f.seq == Some(seq))
    }

    #[must_use]
    pub fn fresh_count(&self) -> usize {
        self.queue.iter().filter(|f| f.state == FrameState::Fresh).count()
    }

    /// Whether the block-ack agreement is mid-negotiation or mid-exchange.
    #[must_use]
    pub fn is_ba_transitional(&self) -> bool {
        self.agreement.as_ref().is_some_and(|a| a.state.is_transitional())
    }

    /// Last sequence number of the transmit window.
    #[must_use]
    pub fn win_ends(&self) -> Option<SeqNum> {
        let start = self.win_starts?;
        (self.win_sizes > 0).then(|| start.add(self.win_sizes - 1))
    }

    #[must_use]
    pub fn win_endr(&self) -> Option<SeqNum> {
        let start = self.win_startr?;
        (self.win_sizer > 0).then(|| start.add(self.win_sizer - 1))
    }

    /// Close the transmit window; queued frames that were awaiting acknowledgement become
    /// fresh again.
    pub fn reset_tx_window(&mut self) {
        self.win_starts = None;
        self.win_sizes = 0;
        for frame in self.queue.iter_mut() {
            if frame.state != FrameState::Fresh {
                frame.state = FrameState::Fresh;
            }
            frame.ba_active = false;
        }
    }

    pub fn reset_rx_window(&mut self) {
        self.win_startr = None;
        self.win_sizer = 0;
        self.ba_bitmap = 0;
    }

    /// Start numbering at `seq`; only meaningful before the first enqueue.
    pub fn seed_sequence(&mut self, seq: SeqNum) {
        self.seq_num = seq;
    }

    pub(crate) fn push_back(&mut self, frame: MacFrame) {
        self.agg_size += frame.payload_len();
        self.queue.push_back(frame);
        self.num_packets += 1;
        assert_eq!(self.num_packets, self.queue.len(), "flow packet count out of sync");
    }

    /// Insert keeping ascending order relative to the next expected sequence number.
    pub(crate) fn insert_sorted(&mut self, frame: MacFrame) {
        let base = self.seq_num;
        let dist = |f: &MacFrame| f.seq.map_or(u16::MAX, |s| base.distance_to(s));
        let d = dist(&frame);
        let idx = self.queue.iter().position(|f| dist(f) > d).unwrap_or(self.queue.len());
        self.agg_size += frame.payload_len();
        self.queue.insert(idx, frame);
        self.num_packets += 1;
        assert_eq!(self.num_packets, self.queue.len(), "flow packet count out of sync");
    }

    pub(crate) fn remove_front(&mut self) -> Option<MacFrame> {
        self.remove_at(0)
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Option<MacFrame> {
        let frame = self.queue.remove(index)?;
        self.num_packets -= 1;
        assert!(self.agg_size >= frame.payload_len(), "flow byte count underflow");
        self.agg_size -= frame.payload_len();
        Some(frame)
    }

    /// Remove every frame matching `pred`, preserving the order of the rest.
    pub(crate) fn drain_where(&mut self, mut pred: impl FnMut(&MacFrame) -> bool) -> Vec<MacFrame> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for frame in self.queue.drain(..) {
            if pred(&frame) {
                removed.push(frame);
            } else {
                kept.push_back(frame);
            }
        }
        self.queue = kept;
        self.num_packets = self.queue.len();
        self.agg_size = self.queue.iter().map(MacFrame::payload_len).sum();
        removed
    }

    /// Panics if the packet or byte counters disagree with the queue.
    pub fn assert_consistent(&self) {
        assert_eq!(self.num_packets, self.queue.len(), "num_packets != queue length");
        let bytes: usize = self.queue.iter().map(MacFrame::payload_len).sum();
        assert_eq!(self.agg_size, bytes, "agg_size != sum of payloads");
    }
}

/// Behaviour that distinguishes the three buffer instantiations.
pub trait BufferPolicy {
    const NAME: &'static str;
    const ASSIGNS_SEQUENCE: bool;
    const SORTED_BY_SEQUENCE: bool;
}

#[derive(Debug)]
pub struct OutputPolicy;
#[derive(Debug)]
pub struct StagingPolicy;
#[derive(Debug)]
pub struct InputPolicy;

impl BufferPolicy for OutputPolicy {
    const NAME: &'static str = "output";
    const ASSIGNS_SEQUENCE: bool = true;
    const SORTED_BY_SEQUENCE: bool = false;
}

impl BufferPolicy for StagingPolicy {
    const NAME: &'static str = "amsdu";
    const ASSIGNS_SEQUENCE: bool = false;
    const SORTED_BY_SEQUENCE: bool = false;
}

impl BufferPolicy for InputPolicy {
    const NAME: &'static str = "input";
    const ASSIGNS_SEQUENCE: bool = false;
    const SORTED_BY_SEQUENCE: bool = true;
}

pub type OutputBuffer = FlowTable<OutputPolicy>;
pub type StagingBuffer = FlowTable<StagingPolicy>;
pub type InputBuffer = FlowTable<InputPolicy>;

/// Map of flows plus the round-robin cursor.
#[derive(Debug)]
pub struct FlowTable<P: BufferPolicy> {
    flows: BTreeMap<FlowKey, FlowState>,
    last_serviced: Option<FlowKey>,
    _policy: PhantomData<P>,
}

impl<P: BufferPolicy> Default for FlowTable<P> {
    fn default() -> Self {
        Self { flows: BTreeMap::new(), last_serviced: None, _policy: PhantomData }
    }
}

impl<P: BufferPolicy> FlowTable<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<&FlowState> {
        self.flows.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowState> {
        self.flows.get_mut(key)
    }

    pub fn get_or_create(&mut self, key: FlowKey, now: SimTime) -> &mut FlowState {
        self.flows.entry(key).or_insert_with(|| {
            trace!(buffer = P::NAME, flow = %key, "flow created");
            FlowState::new(now)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &FlowState)> {
        self.flows.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&FlowKey, &mut FlowState)> {
        self.flows.iter_mut()
    }

    #[must_use]
    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }

    /// Packets queued for `key`, zero for an unknown flow.
    #[must_use]
    pub fn packets_for(&self, key: &FlowKey) -> usize {
        self.flows.get(key).map_or(0, FlowState::num_packets)
    }

    #[must_use]
    pub fn total_packets(&self) -> usize {
        self.flows.values().map(FlowState::num_packets).sum()
    }

    /// Append `frame` to its flow, creating the flow on first use. The output policy stamps
    /// the flow's next sequence number and returns it.
    pub fn enqueue(&mut self, key: FlowKey, mut frame: MacFrame, now: SimTime) -> Option<SeqNum> {
        let flow = self.get_or_create(key, now);
        let assigned = if P::ASSIGNS_SEQUENCE {
            let seq = flow.seq_num;
            frame.seq = Some(seq);
            flow.seq_num = seq.next();
            Some(seq)
        } else {
            None
        };
        frame.inserted_at = now;
        if P::SORTED_BY_SEQUENCE {
            flow.insert_sorted(frame);
        } else {
            flow.push_back(frame);
        }
        trace!(buffer = P::NAME, flow = %key, packets = flow.num_packets(), "enqueued");
        assigned
    }

    /// Admission check: the flow plus `sibling_packets` of the same key held elsewhere must
    /// stay below `capacity`.
    #[must_use]
    pub fn try_reserve(&self, key: &FlowKey, capacity: usize, sibling_packets: usize) -> bool {
        self.packets_for(key) + sibling_packets < capacity
    }

    /// Detach the head frame; counters are updated with the removal.
    pub fn remove_front(&mut self, key: &FlowKey) -> Option<MacFrame> {
        self.flows.get_mut(key)?.remove_front()
    }

    /// Round-robin over flows starting after the last-serviced key, returning the first for
    /// which `eligible` holds. Visits each flow at most once.
    pub fn next_flow_where(&mut self, eligible: impl Fn(&FlowKey, &FlowState) -> bool) -> Option<FlowKey> {
        let found = self.peek_flow_where(eligible);
        if let Some(key) = found {
            self.last_serviced = Some(key);
        }
        found
    }

    /// Same walk as [`next_flow_where`](Self::next_flow_where) without moving the cursor.
    #[must_use]
    pub fn peek_flow_where(&self, eligible: impl Fn(&FlowKey, &FlowState) -> bool) -> Option<FlowKey> {
        let probes = self.flows.len();
        match self.last_serviced {
            Some(last) => self
                .flows
                .range((Excluded(last), Unbounded))
                .chain(self.flows.range(..=last))
                .take(probes)
                .find(|(k, f)| eligible(k, f))
                .map(|(k, _)| *k),
            None => self.flows.iter().take(probes).find(|(k, f)| eligible(k, f)).map(|(k, _)| *k),
        }
    }

    /// Next non-empty flow that is not in a transitional block-ack state.
    pub fn next_non_empty_flow(&mut self) -> Option<FlowKey> {
        self.next_flow_where(|_, f| !f.is_empty() && !f.is_ba_transitional())
    }

    #[must_use]
    pub fn last_serviced(&self) -> Option<FlowKey> {
        self.last_serviced
    }

    /// Remove every flow, returning the queued frames.
    pub fn clear(&mut self) -> Vec<(FlowKey, MacFrame)> {
        let mut drained = Vec::new();
        for (key, mut flow) in std::mem::take(&mut self.flows) {
            while let Some(frame) = flow.remove_front() {
                drained.push((key, frame));
            }
        }
        self.last_serviced = None;
        drained
    }
}
