#![forbid(unsafe_code)]

//! PHY collaborator interface and a reference HT-mixed 20 MHz model.

use dot11n_core::MacAddr;
use std::collections::HashMap;
use std::time::Duration;

use crate::frame::FrameKind;

/// Reduced interframe space used between bursts when both sides enable RIFS mode.
pub const RIFS: Duration = Duration::from_micros(2);

/// Timing and error queries the MAC issues to the physical layer.
pub trait PhyModel {
    /// Airtime of a `size`-byte frame of `kind` sent to `peer`.
    fn transmission_duration(&self, size: usize, kind: FrameKind, peer: MacAddr, mcs_hint: Option<u8>) -> Duration;

    fn max_antenna_elements(&self) -> u8;

    /// Highest MCS the local radio supports.
    fn max_mcs_index(&self) -> u8;

    fn sifs(&self) -> Duration;

    fn slot_time(&self) -> Duration;

    fn rifs(&self) -> Duration {
        RIFS
    }

    /// Per-bit error probability at `snr_db` for `mcs`.
    fn bit_error_rate(&self, snr_db: f64, mcs: u8) -> f64;
}

/// Data bits per OFDM symbol of MCS 0-7 at 20 MHz with one spatial stream.
const HT_NDBPS_20MHZ: [u32; 8] = [26, 52, 78, 104, 156, 208, 234, 260];
/// Legacy OFDM 24 Mbit/s used for control and management frames.
const LEGACY_NDBPS: u32 = 96;
const LEGACY_PREAMBLE_US: u64 = 20;
const SYMBOL_US: u64 = 4;
const SERVICE_BITS: u32 = 16;
const TAIL_BITS: u32 = 6;

/// Reference HT PHY: 20 MHz, long guard interval, HT-mixed preamble.
#[derive(Debug, Clone)]
pub struct HtPhy {
    antennas: u8,
    default_mcs: u8,
    peer_mcs: HashMap<MacAddr, u8>,
}

impl HtPhy {
    #[must_use]
    pub fn new(antennas: u8, default_mcs: u8) -> Self {
        let antennas = antennas.clamp(1, 4);
        let max = antennas * 8 - 1;
        Self { antennas, default_mcs: default_mcs.min(max), peer_mcs: HashMap::new() }
    }

    /// Pin the MCS used towards `peer`.
    pub fn set_peer_mcs(&mut self, peer: MacAddr, mcs: u8) {
        self.peer_mcs.insert(peer, mcs.min(self.max_mcs_index()));
    }

    /// Data bits per symbol of `mcs`.
    #[must_use]
    pub fn ndbps(mcs: u8) -> u32 {
        let streams = u32::from(mcs / 8) + 1;
        HT_NDBPS_20MHZ[usize::from(mcs % 8)] * streams
    }

    fn symbols(bits: u32, ndbps: u32) -> u64 {
        u64::from(bits.div_ceil(ndbps))
    }

    fn mcs_for(&self, peer: MacAddr, hint: Option<u8>) -> u8 {
        hint.or_else(|| self.peer_mcs.get(&peer).copied())
            .unwrap_or(self.default_mcs)
            .min(self.max_mcs_index())
    }
}

impl Default for HtPhy {
    fn default() -> Self {
        Self::new(1, 7)
    }
}

impl PhyModel for HtPhy {
    fn transmission_duration(&self, size: usize, kind: FrameKind, peer: MacAddr, mcs_hint: Option<u8>) -> Duration {
        let bits = SERVICE_BITS + 8 * u32::try_from(size).unwrap_or(u32::MAX / 16) + TAIL_BITS;
        let us = if kind.is_data() {
            let mcs = self.mcs_for(peer, mcs_hint);
            let streams = u64::from(mcs / 8) + 1;
            // L-STF + L-LTF + L-SIG + HT-SIG + HT-STF, then one HT-LTF per stream.
            let preamble = 32 + 4 * streams;
            preamble + SYMBOL_US * Self::symbols(bits, Self::ndbps(mcs))
        } else {
            LEGACY_PREAMBLE_US + SYMBOL_US * Self::symbols(bits, LEGACY_NDBPS)
        };
        Duration::from_micros(us)
    }

    fn max_antenna_elements(&self) -> u8 {
        self.antennas
    }

    fn max_mcs_index(&self) -> u8 {
        self.antennas * 8 - 1
    }

    fn sifs(&self) -> Duration {
        Duration::from_micros(16)
    }

    fn slot_time(&self) -> Duration {
        Duration::from_micros(9)
    }

    fn bit_error_rate(&self, snr_db: f64, mcs: u8) -> f64 {
        let snr = 10f64.powf(snr_db / 10.0);
        // Higher-order modulations need proportionally more SNR for the same error rate.
        let penalty = f64::from(Self::ndbps(mcs % 8)) / f64::from(HT_NDBPS_20MHZ[0]);
        (0.5 * (-snr / (2.0 * penalty)).exp()).clamp(0.0, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndbps_scales_with_streams() {
        assert_eq!(HtPhy::ndbps(0), 26);
        assert_eq!(HtPhy::ndbps(7), 260);
        assert_eq!(HtPhy::ndbps(15), 520);
    }

    #[test]
    fn ack_duration_at_legacy_rate() {
        let phy = HtPhy::default();
        // 16 + 112 + 6 = 134 bits -> 2 symbols
        assert_eq!(phy.transmission_duration(14, FrameKind::Ack, MacAddr::BROADCAST, None), Duration::from_micros(28));
    }

    #[test]
    fn data_duration_uses_ht_mixed_preamble() {
        let phy = HtPhy::new(1, 0);
        let peer = MacAddr::from_node(2);
        // 1500 bytes at MCS 0: 12022 bits / 26 -> 463 symbols
        let d = phy.transmission_duration(1500, FrameKind::QosData, peer, None);
        assert_eq!(d, Duration::from_micros(36 + 4 * 463));
        assert!(phy.transmission_duration(1500, FrameKind::QosData, peer, Some(7)) < d);
    }

    #[test]
    fn mcs_clamped_to_antennas() {
        let mut phy = HtPhy::new(1, 7);
        let peer = MacAddr::from_node(2);
        phy.set_peer_mcs(peer, 15);
        assert_eq!(phy.mcs_for(peer, None), 7);
        assert_eq!(phy.max_mcs_index(), 7);
    }

    #[test]
    fn ber_falls_with_snr() {
        let phy = HtPhy::default();
        assert!(phy.bit_error_rate(5.0, 0) > phy.bit_error_rate(20.0, 0));
        assert!(phy.bit_error_rate(20.0, 7) > phy.bit_error_rate(20.0, 0));
        assert!(phy.bit_error_rate(-50.0, 0) <= 0.5);
    }
}
