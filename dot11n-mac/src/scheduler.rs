//! EDCA access-category state and selection.
//!
//! Each access category owns an output buffer, a contention window and a backoff counter.
//! The category whose `backoff + AIFS` expires first wins the medium; ties go to the lowest
//! index. The winner's elapsed backoff is then charged to every other category with traffic,
//! and a category whose counter would go negative has lost an internal collision.

#![forbid(unsafe_code)]

use dot11n_core::{AccessCategory, EdcaParams};
use std::time::Duration;

use crate::buffer::{FlowKey, OutputBuffer};
use crate::congestion::ContentionCtrl;
use crate::tx::PendingTx;

/// State of one access category.
#[derive(Debug)]
pub struct AcState {
    pub ac: AccessCategory,
    pub params: EdcaParams,
    pub output: OutputBuffer,
    pub contention: ContentionCtrl,
    /// Remaining backoff, counted after AIFS.
    pub backoff: Duration,
    /// Some flow of the output buffer can be serviced.
    pub has_packet: bool,
    pub(crate) pending: Option<PendingTx>,
    /// Flow whose burst continues after SIFS (or RIFS) without a new backoff.
    pub(crate) txop_continuation: Option<FlowKey>,
}

impl AcState {
    #[must_use]
    pub fn new(ac: AccessCategory, params: EdcaParams, short_limit: u8, long_limit: u8) -> Self {
        Self {
            ac,
            params,
            output: OutputBuffer::new(),
            contention: ContentionCtrl::new(&params, short_limit, long_limit),
            backoff: Duration::ZERO,
            has_packet: false,
            pending: None,
            txop_continuation: None,
        }
    }

    /// Arbitration interframe space: SIFS plus AIFSN slots.
    #[must_use]
    pub fn aifs(&self, sifs: Duration, slot: Duration) -> Duration {
        sifs + slot * u32::from(self.params.aifsn)
    }

    #[must_use]
    pub fn txop_limit(&self) -> Option<Duration> {
        self.params.txop_limit()
    }

    /// A frame is prepared or some flow can supply one.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.pending.is_some() || self.has_packet
    }

    #[must_use]
    pub fn pending(&self) -> Option<&PendingTx> {
        self.pending.as_ref()
    }
}

/// Index of the category that wins contention, or `None` when nothing is queued.
#[must_use]
pub fn select_active_ac(acs: &[AcState], sifs: Duration, slot: Duration) -> Option<usize> {
    let mut best: Option<(usize, Duration)> = None;
    for (i, ac) in acs.iter().enumerate() {
        if !ac.has_work() {
            continue;
        }
        let expiry = ac.backoff + ac.aifs(sifs, slot);
        if best.map_or(true, |(_, b)| expiry < b) {
            best = Some((i, expiry));
        }
    }
    best.map(|(i, _)| i)
}

/// Charge the time the winner spent in AIFS and backoff to the other categories with
/// traffic. Each loser counts down only after its own AIFS. Returns the indices whose
/// countdown ended in the same slot as the winner's; their counters are left untouched for
/// the caller to redraw.
pub fn pause_other_backoffs(acs: &mut [AcState], winner: usize, sifs: Duration, slot: Duration) -> Vec<usize> {
    let expiry = acs[winner].aifs(sifs, slot) + acs[winner].backoff;
    let mut collided = Vec::new();
    for (i, ac) in acs.iter_mut().enumerate() {
        if i == winner || !ac.has_work() {
            continue;
        }
        let aifs = ac.aifs(sifs, slot);
        if aifs + ac.backoff <= expiry {
            collided.push(i);
        } else {
            ac.backoff = ac.backoff.saturating_sub(expiry.saturating_sub(aifs));
        }
    }
    acs[winner].backoff = Duration::ZERO;
    collided
}

#[cfg(test)]
mod tests {
    use super::*;
    use dot11n_core::EdcaTable;

    const SIFS: Duration = Duration::from_micros(16);
    const SLOT: Duration = Duration::from_micros(9);

    fn acs() -> Vec<AcState> {
        let table = EdcaTable::default();
        AccessCategory::ALL.iter().map(|&ac| AcState::new(ac, *table.get(ac), 7, 4)).collect()
    }

    #[test]
    fn idle_categories_never_win() {
        assert_eq!(select_active_ac(&acs(), SIFS, SLOT), None);
    }

    #[test]
    fn smallest_backoff_plus_aifs_wins() {
        let mut acs = acs();
        acs[1].has_packet = true;
        acs[1].backoff = SLOT;
        acs[3].has_packet = true;
        acs[3].backoff = SLOT * 3;
        // BE: 16 + 27 + 9 = 52us, VO: 16 + 18 + 27 = 61us
        assert_eq!(select_active_ac(&acs, SIFS, SLOT), Some(1));
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let mut acs = acs();
        acs[2].has_packet = true;
        acs[3].has_packet = true;
        assert_eq!(select_active_ac(&acs, SIFS, SLOT), Some(2));
    }

    #[test]
    fn internal_collision_when_countdowns_end_together() {
        let mut acs = acs();
        acs[1].has_packet = true;
        acs[1].backoff = SLOT * 2;
        acs[2].has_packet = true;
        acs[2].backoff = SLOT * 3;
        acs[3].has_packet = true;
        acs[3].backoff = SLOT * 5;
        // BE: 16+27+18 = 61, VI: 16+18+27 = 61, VO: 16+18+45 = 79 -> BE wins the tie
        let winner = select_active_ac(&acs, SIFS, SLOT).unwrap();
        assert_eq!(winner, 1);
        let collided = pause_other_backoffs(&mut acs, winner, SIFS, SLOT);
        assert_eq!(collided, vec![2]);
        // VO counted down 61 - 34 = 27us after its AIFS
        assert_eq!(acs[3].backoff, SLOT * 2);
        assert_eq!(acs[1].backoff, Duration::ZERO);
    }

    #[test]
    fn longer_aifs_shields_a_smaller_backoff() {
        let mut acs = acs();
        acs[0].has_packet = true;
        acs[0].backoff = SLOT;
        acs[1].has_packet = true;
        acs[1].backoff = SLOT * 2;
        // BK: 16+63+9 = 88 has the smaller counter but is still in AIFS when BE ends at 61
        let winner = select_active_ac(&acs, SIFS, SLOT).unwrap();
        assert_eq!(winner, 1);
        let collided = pause_other_backoffs(&mut acs, winner, SIFS, SLOT);
        assert!(collided.is_empty());
        assert_eq!(acs[0].backoff, SLOT);
    }
}
