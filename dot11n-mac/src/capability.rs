#![forbid(unsafe_code)]

//! HT capability records of peers and the IBSS station table.
//!
//! In infrastructure modes the management plane owns peer records and the MAC only reads
//! them; in IBSS mode the MAC discovers peers itself through a probe exchange and keeps the
//! result in a [`StationTable`].

use dot11n_core::{MacAddr, SimTime};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::timer::TimerHandle;

/// Wait for a probe response before treating an IBSS peer as non-HT.
pub const IBSS_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// HT capabilities advertised by a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtCapabilities {
    pub max_mcs_index: u8,
    /// Accepts 7935-byte A-MSDUs.
    pub big_amsdu: bool,
    pub immediate_ba: bool,
    pub delayed_ba: bool,
    pub rifs: bool,
    pub ampdu_length_exponent: u8,
}

impl HtCapabilities {
    /// A-MSDU size limit the peer accepts.
    #[must_use]
    pub fn max_amsdu_size(&self) -> usize {
        if self.big_amsdu { dot11n_core::config::AMSDU_SIZE_2 } else { dot11n_core::config::AMSDU_SIZE_1 }
    }

    #[must_use]
    pub fn max_ampdu_length(&self) -> usize {
        dot11n_core::config::max_ampdu_length_for(self.ampdu_length_exponent)
    }

    /// Lowest MCS of the highest spatial-stream band both sides can use.
    #[must_use]
    pub fn min_usable_mcs(&self, antenna_elements: u8) -> u8 {
        let local_max = antenna_elements.max(1).saturating_mul(8).saturating_sub(1);
        let usable = self.max_mcs_index.min(local_max);
        (usable / 8) * 8
    }
}

/// How this MAC participates in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    AccessPoint,
    Station,
    Ibss,
}

/// Read-only view of a peer supplied by the management plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: MacAddr,
    pub ht: Option<HtCapabilities>,
}

/// Progress of the IBSS HT discovery probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    None,
    RequestQueued,
    InProgress,
    Completed,
}

/// Per-station record kept in IBSS mode.
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub addr: MacAddr,
    pub ht: Option<HtCapabilities>,
    pub probe_status: ProbeStatus,
    pub probe_timer: Option<TimerHandle>,
    pub discovered_at: SimTime,
}

impl StationInfo {
    #[must_use]
    pub fn rifs_supported(&self) -> bool {
        self.ht.is_some_and(|h| h.rifs)
    }
}

/// IBSS station list keyed by address.
#[derive(Debug, Default)]
pub struct StationTable {
    stations: HashMap<MacAddr, StationInfo>,
}

impl StationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, addr: &MacAddr) -> Option<&StationInfo> {
        self.stations.get(addr)
    }

    pub fn get_mut(&mut self, addr: &MacAddr) -> Option<&mut StationInfo> {
        self.stations.get_mut(addr)
    }

    /// Insert an undiscovered station; returns `false` if it was already known.
    pub fn insert_new(&mut self, addr: MacAddr, now: SimTime) -> bool {
        if self.stations.contains_key(&addr) {
            return false;
        }
        debug!(peer = %addr, "new IBSS station");
        self.stations.insert(
            addr,
            StationInfo { addr, ht: None, probe_status: ProbeStatus::None, probe_timer: None, discovered_at: now },
        );
        true
    }

    /// HT capabilities are only trusted once the probe completed.
    #[must_use]
    pub fn ht_capabilities(&self, addr: &MacAddr) -> Option<HtCapabilities> {
        self.stations
            .get(addr)
            .filter(|s| s.probe_status == ProbeStatus::Completed)
            .and_then(|s| s.ht)
    }

    pub fn clear(&mut self) {
        self.stations.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}
