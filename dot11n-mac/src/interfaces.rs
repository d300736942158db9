#![forbid(unsafe_code)]

//! Collaborators the MAC consumes: the network layer above it and the management plane
//! beside it. The PHY lives in [`crate::phy`].

use bytes::Bytes;
use dot11n_core::{MacAddr, Tid};

use crate::capability::{NetworkRole, PeerRecord};
use crate::frame::MacFrame;

/// Head of a network-layer priority queue, inspected before admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub next_hop: MacAddr,
    pub len: usize,
}

/// One network-layer packet handed to (or returned by) the MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub payload: Bytes,
    pub next_hop: MacAddr,
    pub priority: Tid,
}

/// Network-layer output queues.
pub trait NetworkEgress {
    fn top_packet(&self, priority: Tid) -> Option<PacketInfo>;

    fn dequeue_packet(&mut self, priority: Tid) -> Option<OutboundPacket>;

    /// The MAC gave up on `packet` (retry limit, teardown or reset).
    fn packet_dropped(&mut self, packet: OutboundPacket);
}

/// Delivery of received MSDUs. Each MSDU of an A-MSDU is handed off separately with the same
/// source address.
pub trait NetworkIngress {
    fn hand_off(&mut self, payload: Bytes, source: MacAddr);
}

/// Both directions of the network layer.
pub trait NetworkLayer: NetworkEgress + NetworkIngress {}

impl<T: NetworkEgress + NetworkIngress> NetworkLayer for T {}

/// Management queue and association state.
pub trait ManagementPlane {
    /// Queue an ADDBA/DELBA/BAR/BA/probe frame; the outcome is reported back through
    /// `Dot11nMac::on_management_tx_status`.
    fn enqueue_management_frame(&mut self, frame: MacFrame, trigger_send_check: bool);

    fn role(&self) -> NetworkRole;

    /// The AP this station is associated with (station role only).
    fn associated_ap(&self) -> Option<PeerRecord>;

    /// Record of an associated station (access-point role only).
    fn ap_station(&self, addr: MacAddr) -> Option<PeerRecord>;
}
