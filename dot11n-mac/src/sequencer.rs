//! Modulo-4096 MPDU sequence numbers.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest sequence number carried in the sequence control field.
pub const MAX_SEQUENCE_NUMBER: u16 = 4095;
/// Size of the sequence number space.
pub const SEQUENCE_SPACE: u16 = MAX_SEQUENCE_NUMBER + 1;
/// Forward distances below this are "ahead"; the rest of the space is "behind".
pub const HALF_SEQUENCE_SPACE: u16 = SEQUENCE_SPACE / 2;

/// A 12-bit sequence number. All comparisons walk the circular space; values are never
/// subtracted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SeqNum(u16);

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    /// Values outside the 12-bit range are reduced modulo 4096.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        SeqNum(value % SEQUENCE_SPACE)
    }

    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 == MAX_SEQUENCE_NUMBER { SeqNum(0) } else { SeqNum(self.0 + 1) }
    }

    #[must_use]
    pub const fn prev(self) -> Self {
        if self.0 == 0 { SeqNum(MAX_SEQUENCE_NUMBER) } else { SeqNum(self.0 - 1) }
    }

    /// The sequence number `n` slots after this one.
    #[must_use]
    pub const fn add(self, n: u16) -> Self {
        SeqNum(((self.0 as u32 + n as u32) % SEQUENCE_SPACE as u32) as u16)
    }

    /// Number of forward steps from `self` to `later` (0..=4095).
    #[must_use]
    pub const fn distance_to(self, later: SeqNum) -> u16 {
        ((later.0 as u32 + SEQUENCE_SPACE as u32 - self.0 as u32) % SEQUENCE_SPACE as u32) as u16
    }

    /// Whether `self` lies in the `len` slots starting at `start`.
    #[must_use]
    pub const fn is_within(self, start: SeqNum, len: u16) -> bool {
        start.distance_to(self) < len
    }

    /// Whether `self` is strictly ahead of `other` within half the space.
    #[must_use]
    pub const fn is_after(self, other: SeqNum) -> bool {
        let d = other.distance_to(self);
        d != 0 && d < HALF_SEQUENCE_SPACE
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
