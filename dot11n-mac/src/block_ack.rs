#![forbid(unsafe_code)]

//! Block-ack agreement state machine and the transmit/receive scoreboards.
//!
//! Initiator: `Disabled → AddbaRequestPending → AddbaRequestQueued → WaitAddbaResponse →
//! Idle ⇄ Transmitting → BlockAckRequestQueued → WaitBlockAck → Idle`, with
//! `WaitRetryTimer` after a failed negotiation and `DelbaQueued` for teardown.
//! Recipient: `Disabled → ReceiverWaitBaSetup → Receiving → Disabled`.

use std::time::Duration;
use tracing::debug;

use crate::ack::BLOCK_ACK_WINDOW;
use crate::buffer::{FlowKey, FlowState};
use crate::frame::{FrameState, MacFrame};
use crate::sequencer::{SeqNum, HALF_SEQUENCE_SPACE};

/// A flow must hold more than this many packets before an agreement is considered.
pub const BLOCK_ACK_POLICY_THRESHOLD: usize = 5;
pub const MAX_MPDUS_NEGOTIATED_VIA_BA_POLICY: u16 = 64;
pub const ADDBA_RESPONSE_TIMEOUT: Duration = Duration::from_millis(512);
pub const BAP_REINITIATE_TIMEOUT: Duration = Duration::from_secs(1);
pub const BLOCK_ACK_REQUEST_TIMEOUT: Duration = Duration::from_millis(512);

/// Immediate agreements answer a BAR with a BA after SIFS; delayed ones ACK the BAR and send
/// the BA later as its own frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaType {
    Immediate,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaRole {
    Initiator,
    Recipient,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BaaState {
    Disabled,
    Idle,
    AddbaRequestPending,
    AddbaRequestQueued,
    WaitAddbaResponse,
    BlockAckRequestQueued,
    WaitBlockAck,
    DelbaQueued,
    Transmitting,
    WaitRetryTimer,
    ReceiverWaitBaSetup,
    Receiving,
}

impl BaaState {
    /// States in which the flow must not be picked for new data.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            BaaState::AddbaRequestQueued
                | BaaState::WaitAddbaResponse
                | BaaState::BlockAckRequestQueued
                | BaaState::WaitBlockAck
                | BaaState::DelbaQueued
        )
    }

    /// Legal edges of the agreement graph.
    #[must_use]
    pub fn can_transition_to(self, next: BaaState) -> bool {
        use BaaState::*;
        if next == Disabled || next == DelbaQueued {
            return true;
        }
        matches!(
            (self, next),
            (Disabled, AddbaRequestPending)
                | (AddbaRequestPending, AddbaRequestQueued)
                | (AddbaRequestQueued, WaitAddbaResponse)
                | (AddbaRequestQueued, WaitRetryTimer)
                | (WaitAddbaResponse, Idle)
                | (WaitAddbaResponse, WaitRetryTimer)
                | (Idle, Transmitting)
                | (Transmitting, Idle)
                | (Transmitting, BlockAckRequestQueued)
                | (BlockAckRequestQueued, WaitBlockAck)
                | (BlockAckRequestQueued, Idle)
                | (WaitBlockAck, Idle)
                | (WaitBlockAck, BlockAckRequestQueued)
                | (Disabled, ReceiverWaitBaSetup)
                | (ReceiverWaitBaSetup, Receiving)
                | (Receiving, ReceiverWaitBaSetup)
        )
    }
}

/// Agreement owned by one flow of the output buffer (initiator) or input buffer (recipient).
#[derive(Debug, Clone)]
pub struct BlockAckAgreement {
    pub ba_type: BaType,
    pub role: BaRole,
    pub(crate) state: BaaState,
    pub starting_seq: Option<SeqNum>,
    pub num_pkts_negotiated: u16,
    pub num_pkts_sent: u16,
    pub num_pkts_left_in_txop: u16,
    pub num_pkts_in_session: u16,
    pub nav_duration: Duration,
    /// Bumped whenever a timer is armed or abandoned; expiries carrying an older value are
    /// ignored.
    generation: u32,
    pub block_ack_sent: bool,
    pub dialog_token: u8,
}

impl BlockAckAgreement {
    #[must_use]
    pub fn new_initiator(ba_type: BaType) -> Self {
        Self {
            ba_type,
            role: BaRole::Initiator,
            state: BaaState::Disabled,
            starting_seq: None,
            num_pkts_negotiated: 0,
            num_pkts_sent: 0,
            num_pkts_left_in_txop: 0,
            num_pkts_in_session: 0,
            nav_duration: Duration::ZERO,
            generation: 0,
            block_ack_sent: false,
            dialog_token: 0,
        }
    }

    #[must_use]
    pub fn new_recipient(ba_type: BaType, dialog_token: u8, buffer_size: u16, ssn: SeqNum) -> Self {
        Self {
            role: BaRole::Recipient,
            state: BaaState::ReceiverWaitBaSetup,
            starting_seq: Some(ssn),
            num_pkts_negotiated: buffer_size,
            dialog_token,
            ..Self::new_initiator(ba_type)
        }
    }

    #[must_use]
    pub fn state(&self) -> BaaState {
        self.state
    }

    pub fn transition(&mut self, key: &FlowKey, next: BaaState) {
        debug_assert!(self.state.can_transition_to(next), "illegal BA transition {:?} -> {:?}", self.state, next);
        if self.state != next {
            debug!(flow = %key, from = ?self.state, to = ?next, "block-ack state");
        }
        if next != self.state {
            // Any pending timer belongs to the state being left.
            self.generation = self.generation.wrapping_add(1);
        }
        self.state = next;
    }

    /// Generation to stamp on a newly armed timer.
    pub fn arm_timer(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    #[must_use]
    pub fn is_timer_current(&self, generation: u32) -> bool {
        self.generation == generation
    }

    /// Forget per-session counters after a burst completes or is abandoned.
    pub fn reset_session(&mut self) {
        self.num_pkts_sent = 0;
        self.num_pkts_left_in_txop = 0;
        self.num_pkts_in_session = 0;
        self.nav_duration = Duration::ZERO;
    }
}

/// Result of applying a received Block Ack to a transmit window.
#[derive(Debug, Default)]
pub struct ScoreboardUpdate {
    /// Contiguously acknowledged frames removed from the flow, in sequence order.
    pub freed: Vec<MacFrame>,
    /// Frames newly marked acknowledged but retained behind a gap.
    pub retained_acked: usize,
}

/// Walk the transmit window against `bitmap`. A BA whose starting sequence number differs
/// from `win_starts` is ignored and `None` returned.
pub fn apply_block_ack(flow: &mut FlowState, ssn: SeqNum, bitmap: u64) -> Option<ScoreboardUpdate> {
    let start = flow.win_starts?;
    if start != ssn {
        return None;
    }
    let size = flow.win_sizes.min(BLOCK_ACK_WINDOW);
    let mut update = ScoreboardUpdate::default();
    let mut contiguous = true;
    let mut new_start = start;
    for pos in 0..size {
        let seq = start.add(pos);
        let bit = bitmap & (1u64 << pos) != 0;
        let Some(idx) = flow.position_of(seq) else {
            // Already released (dropped at the retry limit); does not break the prefix.
            if contiguous {
                new_start = seq.next();
            }
            continue;
        };
        let acked = bit || flow.get(idx).is_some_and(|f| f.state == FrameState::Acked);
        if !acked {
            contiguous = false;
            continue;
        }
        if contiguous {
            if let Some(frame) = flow.remove_at(idx) {
                update.freed.push(frame);
            }
            new_start = seq.next();
        } else if let Some(frame) = flow.get_mut(idx) {
            if frame.state != FrameState::Acked {
                frame.state = FrameState::Acked;
                update.retained_acked += 1;
            }
        }
    }
    flow.win_sizes = size - start.distance_to(new_start);
    flow.win_starts = Some(new_start);
    Some(update)
}

/// Receive scoreboard outcome for one data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxScoreboard {
    InWindow,
    /// Window slid forward by this many positions.
    Advanced(u16),
    OutOfRange,
}

/// Open the recipient window at `ssn`.
pub fn open_rx_window(flow: &mut FlowState, ssn: SeqNum, size: u16) {
    flow.win_startr = Some(ssn);
    flow.win_sizer = size.clamp(1, BLOCK_ACK_WINDOW);
    flow.ba_bitmap = 0;
}

fn shift_rx_window(flow: &mut FlowState, by: u16) {
    if let Some(start) = flow.win_startr {
        flow.win_startr = Some(start.add(by));
        flow.ba_bitmap = if by >= BLOCK_ACK_WINDOW { 0 } else { flow.ba_bitmap >> by };
    }
}

/// Record reception of `seq` under an active agreement.
pub fn record_rx(flow: &mut FlowState, seq: SeqNum) -> RxScoreboard {
    let Some(start) = flow.win_startr else {
        return RxScoreboard::OutOfRange;
    };
    let size = flow.win_sizer.max(1);
    let d = start.distance_to(seq);
    if d < size {
        flow.ba_bitmap |= 1u64 << d;
        RxScoreboard::InWindow
    } else if d < HALF_SEQUENCE_SPACE {
        let shift = d - size + 1;
        shift_rx_window(flow, shift);
        flow.ba_bitmap |= 1u64 << (size - 1);
        RxScoreboard::Advanced(shift)
    } else {
        RxScoreboard::OutOfRange
    }
}

/// Move the recipient window to a BAR's starting sequence number; stale BARs are ignored.
pub fn advance_rx_window(flow: &mut FlowState, ssn: SeqNum) -> bool {
    let Some(start) = flow.win_startr else {
        return false;
    };
    let d = start.distance_to(ssn);
    if d == 0 || d >= HALF_SEQUENCE_SPACE {
        return false;
    }
    shift_rx_window(flow, d);
    true
}
