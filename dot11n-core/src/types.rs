#![forbid(unsafe_code)]

//! Addressing, traffic identifiers and the simulation clock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;
use std::time::Duration;

/// 48-bit IEEE 802 MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Locally administered unicast address derived from a small node number.
    #[must_use]
    pub const fn from_node(node: u16) -> Self {
        MacAddr([0x02, 0x00, 0x00, 0x00, (node >> 8) as u8, node as u8])
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group (multicast or broadcast) addresses have the I/G bit set.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for slot in out.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("short MAC address: {s}"))?;
            *slot = u8::from_str_radix(part, 16).map_err(|e| format!("bad octet {part:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("long MAC address: {s}"));
        }
        Ok(MacAddr(out))
    }
}

/// Traffic identifier (user priority 0-7) carried in the QoS control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tid(u8);

impl Tid {
    pub const MAX: u8 = 7;

    #[must_use]
    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Tid(value))
    }

    /// Network-layer priorities above 7 are folded into the 3-bit user priority.
    #[must_use]
    pub fn from_priority(priority: u8) -> Self {
        Tid(priority & 0x07)
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    /// All TIDs from highest to lowest priority.
    pub fn descending() -> impl Iterator<Item = Tid> {
        (0..=Self::MAX).rev().map(Tid)
    }

    #[must_use]
    pub fn access_category(self) -> AccessCategory {
        AccessCategory::from_tid(self)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// EDCA access categories in ascending priority; the discriminant is the AC index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessCategory {
    Background = 0,
    BestEffort = 1,
    Video = 2,
    Voice = 3,
}

impl AccessCategory {
    pub const ALL: [AccessCategory; 4] =
        [AccessCategory::Background, AccessCategory::BestEffort, AccessCategory::Video, AccessCategory::Voice];

    /// 802.1D user priority to access category mapping.
    #[must_use]
    pub fn from_tid(tid: Tid) -> Self {
        match tid.value() {
            1 | 2 => AccessCategory::Background,
            0 | 3 => AccessCategory::BestEffort,
            4 | 5 => AccessCategory::Video,
            _ => AccessCategory::Voice,
        }
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            AccessCategory::Background => "bk",
            AccessCategory::BestEffort => "be",
            AccessCategory::Video => "vi",
            AccessCategory::Voice => "vo",
        }
    }
}

/// Discrete-event simulation time measured from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(Duration);

impl SimTime {
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    #[must_use]
    pub const fn from_duration(d: Duration) -> Self {
        SimTime(d)
    }

    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        SimTime(Duration::from_micros(us))
    }

    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(Duration::from_millis(ms))
    }

    #[must_use]
    pub fn since_start(self) -> Duration {
        self.0
    }

    /// Elapsed time since `earlier`, zero when `earlier` is in the future.
    #[must_use]
    pub fn saturating_since(self, earlier: SimTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0 + rhs)
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0.as_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_addr_display_and_parse() {
        let addr = MacAddr::from_node(0x0102);
        let text = addr.to_string();
        assert_eq!(text, "02:00:00:00:01:02");
        assert_eq!(text.parse::<MacAddr>().unwrap(), addr);
        assert!("02:00".parse::<MacAddr>().is_err());
    }

    #[test]
    fn group_bit() {
        assert!(MacAddr::BROADCAST.is_group());
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(!MacAddr::from_node(3).is_group());
    }

    #[test]
    fn tid_to_access_category() {
        let acs: Vec<_> = (0..8).map(|p| Tid::from_priority(p).access_category()).collect();
        assert_eq!(
            acs,
            vec![
                AccessCategory::BestEffort,
                AccessCategory::Background,
                AccessCategory::Background,
                AccessCategory::BestEffort,
                AccessCategory::Video,
                AccessCategory::Video,
                AccessCategory::Voice,
                AccessCategory::Voice,
            ]
        );
        assert!(Tid::new(8).is_none());
    }

    #[test]
    fn sim_time_arithmetic() {
        let t = SimTime::from_millis(2) + Duration::from_micros(500);
        assert_eq!(t - SimTime::from_millis(1), Duration::from_micros(1500));
        assert_eq!(SimTime::ZERO - t, Duration::ZERO);
    }
}
