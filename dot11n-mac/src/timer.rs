#![forbid(unsafe_code)]

//! Discrete-event timer queue owned by one MAC instance.
//!
//! Flush timers of the staging and input buffers are cancelled by handle. Block-ack timers
//! carry the agreement's generation number instead and are ignored on expiry when the
//! agreement has moved on.
//!
//! Flush timers are armed through [`TimerQueue::schedule_unique`]: one flow has at most one
//! live timer per purpose, and arming a second one is a fatal invariant violation.

use dot11n_core::{MacAddr, SimTime};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::buffer::FlowKey;

/// Identifies one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    AddbaResponseTimeout { key: FlowKey, generation: u32 },
    BapReinitiate { key: FlowKey, generation: u32 },
    BlockAckKeepAlive { key: FlowKey, generation: u32 },
    BlockAckResponseTimeout { key: FlowKey, generation: u32 },
    RecipientInactivity { key: FlowKey, generation: u32 },
    AmsduFlush { key: FlowKey },
    InputFlush { key: FlowKey },
    IbssProbeTimeout { peer: MacAddr },
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(SimTime, u64)>>,
    pending: HashMap<u64, TimerEvent>,
    unique: HashMap<TimerEvent, u64>,
    next_id: u64,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: SimTime, event: TimerEvent) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((at, id)));
        self.pending.insert(id, event);
        TimerHandle(id)
    }

    /// Schedule `event`, which must not already have a live timer.
    ///
    /// # Panics
    ///
    /// When a timer for the same event is still pending.
    pub fn schedule_unique(&mut self, at: SimTime, event: TimerEvent) -> TimerHandle {
        let live = self.unique.get(&event).is_some_and(|id| self.pending.contains_key(id));
        assert!(!live, "timer {event:?} armed twice");
        let handle = self.schedule(at, event);
        self.unique.insert(event, handle.0);
        handle
    }

    /// Hard cancel; returns whether the timer was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.take(handle.0).is_some()
    }

    fn take(&mut self, id: u64) -> Option<TimerEvent> {
        let event = self.pending.remove(&id)?;
        if self.unique.get(&event) == Some(&id) {
            self.unique.remove(&event);
        }
        Some(event)
    }

    #[must_use]
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains_key(&handle.0)
    }

    /// Earliest live deadline. Cancelled entries at the top of the heap are discarded.
    pub fn next_deadline(&mut self) -> Option<SimTime> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: SimTime) -> Option<(SimTime, TimerHandle, TimerEvent)> {
        let at = self.next_deadline()?;
        if at > now {
            return None;
        }
        let Reverse((at, id)) = self.heap.pop()?;
        let event = self.take(id)?;
        Some((at, TimerHandle(id), event))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
        self.unique.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(n: u16) -> TimerEvent {
        TimerEvent::IbssProbeTimeout { peer: MacAddr::from_node(n) }
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(SimTime::from_millis(5), probe(5));
        q.schedule(SimTime::from_millis(1), probe(1));
        q.schedule(SimTime::from_millis(3), probe(3));
        assert!(q.pop_due(SimTime::ZERO).is_none());
        let fired: Vec<_> = std::iter::from_fn(|| q.pop_due(SimTime::from_millis(4))).map(|(_, _, e)| e).collect();
        assert_eq!(fired, vec![probe(1), probe(3)]);
        assert_eq!(q.next_deadline(), Some(SimTime::from_millis(5)));
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut q = TimerQueue::new();
        let h = q.schedule(SimTime::from_millis(1), probe(1));
        assert!(q.cancel(h));
        assert!(!q.cancel(h));
        assert!(!q.is_pending(h));
        assert_eq!(q.next_deadline(), None);
        assert!(q.pop_due(SimTime::from_millis(10)).is_none());
    }

    fn flush(n: u16) -> TimerEvent {
        let key = FlowKey::new(MacAddr::from_node(n), dot11n_core::Tid::from_priority(0));
        TimerEvent::AmsduFlush { key }
    }

    #[test]
    #[should_panic(expected = "armed twice")]
    fn second_flush_timer_for_a_flow_is_fatal() {
        let mut q = TimerQueue::new();
        q.schedule_unique(SimTime::from_millis(1), flush(1));
        q.schedule_unique(SimTime::from_millis(2), flush(1));
    }

    #[test]
    fn flush_timer_can_be_rearmed_once_gone() {
        let mut q = TimerQueue::new();
        let h = q.schedule_unique(SimTime::from_millis(1), flush(1));
        q.schedule_unique(SimTime::from_millis(1), flush(2));
        assert!(q.cancel(h));
        q.schedule_unique(SimTime::from_millis(3), flush(1));

        let fired = q.pop_due(SimTime::from_millis(1)).map(|(_, _, e)| e);
        assert_eq!(fired, Some(flush(2)));
        q.schedule_unique(SimTime::from_millis(4), flush(2));
        assert_eq!(q.len(), 2);
    }
}
