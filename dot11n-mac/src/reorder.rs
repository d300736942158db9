//! Receive reordering.
//! Holds out-of-order frames of one input flow and releases them in sequence order.

#![forbid(unsafe_code)]

use dot11n_core::SimTime;

use crate::ack::BLOCK_ACK_WINDOW;
use crate::buffer::FlowState;
use crate::frame::MacFrame;
use crate::sequencer::{SeqNum, HALF_SEQUENCE_SPACE, SEQUENCE_SPACE};

/// Frames further than this ahead of the next expected one force earlier frames out.
pub const REORDER_WINDOW: u16 = BLOCK_ACK_WINDOW;

/// Offer a received frame to `flow`. Returns the frames now deliverable in order, or `None`
/// when the frame is a duplicate or older than the next expected sequence number.
///
/// A frame at least [`REORDER_WINDOW`] ahead releases everything before
/// `seq - (REORDER_WINDOW - 1)`, gaps included.
pub fn push(flow: &mut FlowState, mut frame: MacFrame, now: SimTime) -> Option<Vec<MacFrame>> {
    let Some(seq) = frame.seq else {
        return Some(vec![frame]);
    };
    let d = flow.seq_num.distance_to(seq);
    if d >= HALF_SEQUENCE_SPACE || flow.position_of(seq).is_some() {
        return None;
    }
    let mut ready = Vec::new();
    if d >= REORDER_WINDOW {
        release_before(flow, seq.add(SEQUENCE_SPACE - (REORDER_WINDOW - 1)), &mut ready);
    }
    frame.inserted_at = now;
    flow.insert_sorted(frame);
    drain_ready(flow, &mut ready);
    Some(ready)
}

/// Move the next expected sequence number forward to `ssn` (BAR or new agreement), releasing
/// everything buffered before it plus whatever becomes contiguous.
pub fn advance_to(flow: &mut FlowState, ssn: SeqNum) -> Vec<MacFrame> {
    let mut ready = Vec::new();
    release_before(flow, ssn, &mut ready);
    drain_ready(flow, &mut ready);
    ready
}

/// Release every buffered frame regardless of gaps (flush timer, teardown).
pub fn flush(flow: &mut FlowState) -> Vec<MacFrame> {
    let mut ready = Vec::with_capacity(flow.num_packets());
    while let Some(frame) = flow.remove_front() {
        if let Some(seq) = frame.seq {
            flow.seq_num = seq.next();
        }
        ready.push(frame);
    }
    ready
}

fn release_before(flow: &mut FlowState, ssn: SeqNum, ready: &mut Vec<MacFrame>) {
    let base = flow.seq_num;
    let limit = base.distance_to(ssn);
    if limit == 0 || limit >= HALF_SEQUENCE_SPACE {
        return;
    }
    while flow.front().and_then(|f| f.seq).is_some_and(|s| base.distance_to(s) < limit) {
        if let Some(frame) = flow.remove_front() {
            ready.push(frame);
        }
    }
    flow.seq_num = ssn;
}

fn drain_ready(flow: &mut FlowState, ready: &mut Vec<MacFrame>) {
    while flow.front().is_some_and(|f| f.seq == Some(flow.seq_num)) {
        if let Some(frame) = flow.remove_front() {
            ready.push(frame);
        }
        flow.seq_num = flow.seq_num.next();
    }
}
