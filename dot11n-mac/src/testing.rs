#![forbid(unsafe_code)]

//! In-memory collaborators for tests: a network layer with per-TID queues, a management
//! plane that records what the MAC queued, and a scripted sub-frame error model.

use bytes::Bytes;
use dot11n_core::{MacAddr, Tid};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::ampdu::SubframeErrorModel;
use crate::capability::{HtCapabilities, NetworkRole, PeerRecord};
use crate::frame::MacFrame;
use crate::interfaces::{ManagementPlane, NetworkEgress, NetworkIngress, OutboundPacket, PacketInfo};

/// Capabilities of a peer supporting every HT feature the MAC uses.
#[must_use]
pub fn full_ht() -> HtCapabilities {
    HtCapabilities {
        max_mcs_index: 7,
        big_amsdu: true,
        immediate_ba: true,
        delayed_ba: true,
        rifs: true,
        ampdu_length_exponent: 3,
    }
}

#[derive(Debug, Default)]
pub struct MockNetwork {
    queues: BTreeMap<u8, VecDeque<OutboundPacket>>,
    /// MSDUs handed off by the MAC, with their source address.
    pub delivered: Vec<(Bytes, MacAddr)>,
    pub dropped: Vec<OutboundPacket>,
}

impl MockNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, next_hop: MacAddr, priority: Tid, payload: impl Into<Bytes>) {
        let packet = OutboundPacket { payload: payload.into(), next_hop, priority };
        self.queues.entry(priority.value()).or_default().push_back(packet);
    }

    /// Packets still waiting for the MAC.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

impl NetworkEgress for MockNetwork {
    fn top_packet(&self, priority: Tid) -> Option<PacketInfo> {
        self.queues
            .get(&priority.value())
            .and_then(VecDeque::front)
            .map(|p| PacketInfo { next_hop: p.next_hop, len: p.payload.len() })
    }

    fn dequeue_packet(&mut self, priority: Tid) -> Option<OutboundPacket> {
        self.queues.get_mut(&priority.value()).and_then(VecDeque::pop_front)
    }

    fn packet_dropped(&mut self, packet: OutboundPacket) {
        self.dropped.push(packet);
    }
}

impl NetworkIngress for MockNetwork {
    fn hand_off(&mut self, payload: Bytes, source: MacAddr) {
        self.delivered.push((payload, source));
    }
}

#[derive(Debug)]
pub struct MockManagement {
    role: NetworkRole,
    peers: HashMap<MacAddr, PeerRecord>,
    queue: VecDeque<MacFrame>,
}

impl MockManagement {
    fn with_role(role: NetworkRole) -> Self {
        Self { role, peers: HashMap::new(), queue: VecDeque::new() }
    }

    #[must_use]
    pub fn access_point() -> Self {
        Self::with_role(NetworkRole::AccessPoint)
    }

    /// Station associated with `ap`.
    #[must_use]
    pub fn station(ap: PeerRecord) -> Self {
        Self::with_role(NetworkRole::Station).with_peer(ap)
    }

    #[must_use]
    pub fn ibss() -> Self {
        Self::with_role(NetworkRole::Ibss)
    }

    #[must_use]
    pub fn with_peer(mut self, peer: PeerRecord) -> Self {
        self.insert_peer(peer);
        self
    }

    pub fn insert_peer(&mut self, peer: PeerRecord) {
        self.peers.insert(peer.addr, peer);
    }

    /// Oldest queued frame.
    pub fn pop(&mut self) -> Option<MacFrame> {
        self.queue.pop_front()
    }

    /// Frames queued since the last drain, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = MacFrame> + '_ {
        self.queue.drain(..)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl ManagementPlane for MockManagement {
    fn enqueue_management_frame(&mut self, frame: MacFrame, _trigger_send_check: bool) {
        self.queue.push_back(frame);
    }

    fn role(&self) -> NetworkRole {
        self.role
    }

    fn associated_ap(&self) -> Option<PeerRecord> {
        match self.role {
            NetworkRole::Station => self.peers.values().next().copied(),
            _ => None,
        }
    }

    fn ap_station(&self, addr: MacAddr) -> Option<PeerRecord> {
        match self.role {
            NetworkRole::AccessPoint => self.peers.get(&addr).copied(),
            _ => None,
        }
    }
}

/// Corrupts the sub-frames at the given positions of every A-MPDU it inspects.
#[derive(Debug, Clone, Default)]
pub struct ScriptedErrors {
    corrupted: Vec<usize>,
    index: usize,
}

impl ScriptedErrors {
    #[must_use]
    pub fn new(corrupted: impl IntoIterator<Item = usize>) -> Self {
        Self { corrupted: corrupted.into_iter().collect(), index: 0 }
    }

    /// Start numbering positions again for the next A-MPDU.
    pub fn rewind(&mut self) {
        self.index = 0;
    }
}

impl SubframeErrorModel for ScriptedErrors {
    fn is_corrupted(&mut self, _snr_db: f64, _bits: usize, _ber: f64) -> bool {
        let hit = self.corrupted.contains(&self.index);
        self.index += 1;
        hit
    }
}
