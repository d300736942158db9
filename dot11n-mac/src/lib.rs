#![forbid(unsafe_code)]
//! IEEE 802.11n MAC data path: A-MSDU and A-MPDU aggregation, block-ack agreements with
//! data bursting, EDCA contention and receive reordering.

pub mod ack;
pub mod aggregation;
pub mod ampdu;
pub mod amsdu;
pub mod block_ack;
pub mod buffer;
pub mod builder;
pub mod capability;
pub mod congestion;
pub mod errors;
pub mod frame;
pub mod interfaces;
pub mod layer;
pub mod management;
pub mod phy;
mod receiver;
pub mod reorder;
pub mod scheduler;
pub mod sequencer;
pub mod stats;
pub mod timer;
pub mod tx;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ack::{BlockAck, BlockAckRequest, BLOCK_ACK_WINDOW};
pub use ampdu::{AmpduFrame, BerErrorModel, SubframeErrorModel};
pub use block_ack::{BaType, BaaState, BlockAckAgreement};
pub use buffer::{FlowKey, FlowState};
pub use capability::{HtCapabilities, NetworkRole, PeerRecord, ProbeStatus};
pub use congestion::{ContentionCtrl, RetryVerdict};
pub use errors::{MacError, MacResult};
pub use frame::{AckPolicy, FrameKind, FrameState, MacFrame};
pub use interfaces::{ManagementPlane, NetworkEgress, NetworkIngress, NetworkLayer, OutboundPacket, PacketInfo};
pub use layer::Dot11nMac;
pub use phy::{HtPhy, PhyModel};
pub use sequencer::SeqNum;
pub use stats::MacStats;
pub use tx::{Transmission, TxStatus, TxUnit};
