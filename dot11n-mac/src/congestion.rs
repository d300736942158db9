#![forbid(unsafe_code)]

//! Per-access-category contention window and retry counters.

use dot11n_core::EdcaParams;
use rand::Rng;
use std::time::Duration;

/// Outcome of a failed transmission attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryVerdict {
    Retry,
    /// The retry limit was reached; counters have already been reset.
    Drop,
}

#[derive(Debug, Clone)]
pub struct ContentionCtrl {
    cw: u16,
    cw_min: u16,
    cw_max: u16,
    /// QoS short retry count.
    qsrc: u8,
    /// QoS long retry count.
    qlrc: u8,
    short_limit: u8,
    long_limit: u8,
}

impl ContentionCtrl {
    #[must_use]
    pub fn new(params: &EdcaParams, short_limit: u8, long_limit: u8) -> Self {
        Self {
            cw: params.cw_min,
            cw_min: params.cw_min,
            cw_max: params.cw_max,
            qsrc: 0,
            qlrc: 0,
            short_limit,
            long_limit,
        }
    }

    /// Count a failed attempt for a frame of `frame_len` bytes. Frames up to the RTS threshold
    /// use the short counter, longer ones the long counter.
    pub fn on_failure(&mut self, frame_len: usize, rts_threshold: usize) -> RetryVerdict {
        let (counter, limit) = if frame_len <= rts_threshold {
            (&mut self.qsrc, self.short_limit)
        } else {
            (&mut self.qlrc, self.long_limit)
        };
        *counter = counter.saturating_add(1);
        if *counter < limit {
            self.cw = ((u32::from(self.cw) + 1) * 2 - 1).min(u32::from(self.cw_max)) as u16;
            RetryVerdict::Retry
        } else {
            self.reset();
            RetryVerdict::Drop
        }
    }

    /// Successful exchange: counters cleared, window back to its minimum.
    pub fn on_success(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.qsrc = 0;
        self.qlrc = 0;
        self.cw = self.cw_min;
    }

    /// Uniform backoff in `[0, cw]` slots.
    pub fn draw_backoff<R: Rng + ?Sized>(&self, rng: &mut R, slot: Duration) -> Duration {
        slot * u32::from(rng.gen_range(0..=self.cw))
    }

    #[must_use]
    pub fn cw(&self) -> u16 {
        self.cw
    }

    #[must_use]
    pub fn qsrc(&self) -> u8 {
        self.qsrc
    }

    #[must_use]
    pub fn qlrc(&self) -> u8 {
        self.qlrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn params() -> EdcaParams {
        EdcaParams { aifsn: 3, cw_min: 15, cw_max: 63, txop_limit_us: 0 }
    }

    #[test]
    fn window_doubles_up_to_max() {
        let mut cc = ContentionCtrl::new(&params(), 7, 4);
        let cws: Vec<_> = (0..4)
            .map(|_| {
                cc.on_failure(100, 2347);
                cc.cw()
            })
            .collect();
        assert_eq!(cws, vec![31, 63, 63, 63]);
        assert_eq!(cc.qsrc(), 4);
    }

    #[test]
    fn short_limit_drops_and_resets() {
        let mut cc = ContentionCtrl::new(&params(), 3, 4);
        assert_eq!(cc.on_failure(100, 2347), RetryVerdict::Retry);
        assert_eq!(cc.on_failure(100, 2347), RetryVerdict::Retry);
        assert_eq!(cc.on_failure(100, 2347), RetryVerdict::Drop);
        assert_eq!((cc.qsrc(), cc.qlrc(), cc.cw()), (0, 0, 15));
    }

    #[test]
    fn long_frames_use_long_counter() {
        let mut cc = ContentionCtrl::new(&params(), 7, 2);
        assert_eq!(cc.on_failure(3000, 2347), RetryVerdict::Retry);
        assert_eq!(cc.qlrc(), 1);
        assert_eq!(cc.qsrc(), 0);
        assert_eq!(cc.on_failure(3000, 2347), RetryVerdict::Drop);
    }

    #[test]
    fn backoff_stays_within_window() {
        let cc = ContentionCtrl::new(&params(), 7, 4);
        let mut rng = StdRng::seed_from_u64(7);
        let slot = Duration::from_micros(9);
        for _ in 0..100 {
            assert!(cc.draw_backoff(&mut rng, slot) <= slot * 15);
        }
    }
}
