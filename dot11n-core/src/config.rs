#![forbid(unsafe_code)]

//! MAC configuration handling. Parses a TOML file into a strongly-typed structure and supports
//! hot-reloading via the `notify` crate. The MAC itself takes an immutable snapshot at
//! construction; reloads only affect MACs built afterwards.

use serde::Deserialize;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::sync::watch;
use notify::{RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher, Event, EventKind};

use crate::{AccessCategory, Dot11nError};

/// Largest A-MPDU any exponent may produce.
pub const AMPDU_MAX_SIZE: usize = 65_535;
/// A-MSDU limits for the two HT capability settings.
pub const AMSDU_SIZE_1: usize = 3839;
pub const AMSDU_SIZE_2: usize = 7935;
/// QoS data MAC header plus FCS around every MSDU or A-MSDU body.
pub const QOS_MPDU_OVERHEAD: usize = 30;

/// Per-access-category EDCA parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EdcaParams {
    pub aifsn: u8,
    pub cw_min: u16,
    pub cw_max: u16,
    /// TXOP limit in microseconds; zero means the category has no TXOP budget.
    #[serde(default)]
    pub txop_limit_us: u32,
}

impl EdcaParams {
    /// `None` when the category is not bounded by a TXOP.
    #[must_use]
    pub fn txop_limit(&self) -> Option<Duration> {
        (self.txop_limit_us > 0).then(|| Duration::from_micros(u64::from(self.txop_limit_us)))
    }
}

/// EDCA parameter set for all four access categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EdcaTable {
    pub background: EdcaParams,
    pub best_effort: EdcaParams,
    pub video: EdcaParams,
    pub voice: EdcaParams,
}

impl Default for EdcaTable {
    fn default() -> Self {
        Self {
            background: EdcaParams { aifsn: 7, cw_min: 15, cw_max: 1023, txop_limit_us: 0 },
            best_effort: EdcaParams { aifsn: 3, cw_min: 15, cw_max: 1023, txop_limit_us: 0 },
            video: EdcaParams { aifsn: 2, cw_min: 7, cw_max: 15, txop_limit_us: 3008 },
            voice: EdcaParams { aifsn: 2, cw_min: 3, cw_max: 7, txop_limit_us: 1504 },
        }
    }
}

impl EdcaTable {
    #[must_use]
    pub fn get(&self, ac: AccessCategory) -> &EdcaParams {
        match ac {
            AccessCategory::Background => &self.background,
            AccessCategory::BestEffort => &self.best_effort,
            AccessCategory::Video => &self.video,
            AccessCategory::Voice => &self.voice,
        }
    }
}

/// Configuration of one 802.11n MAC instance.
///
/// Field names follow Rust conventions; the camel-case names used by existing scenario files
/// are accepted as aliases.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Dot11nConfig {
    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// Opportunistic A-MSDU aggregation.
    #[serde(alias = "isAmsduEnable")]
    pub enable_amsdu: bool,

    /// Advertise and use the 7935-byte A-MSDU limit.
    #[serde(alias = "enableBigAmsdu")]
    pub enable_big_amsdu: bool,

    #[serde(alias = "isAmpduEnable")]
    pub enable_ampdu: bool,

    /// A-MPDU length exponent; maximum length is `2^(13 + e) - 1`.
    #[serde(alias = "ampduLengthExponent")]
    pub ampdu_length_exponent: u8,

    /// Per-flow capacity counted across the output and staging buffers.
    #[serde(alias = "macOutputQueueSize", default = "default_queue_size")]
    pub mac_output_queue_size: usize,

    #[serde(alias = "amsduBufferTimeout", default = "default_amsdu_timeout")]
    pub amsdu_buffer_timeout_ms: u64,

    #[serde(alias = "inputBufferTimeout", default = "default_input_timeout")]
    pub input_buffer_timeout_ms: u64,

    /// Keep-alive and inactivity timeout of block-ack agreements.
    #[serde(alias = "blockAckPolicyTimeout", default = "default_bap_timeout")]
    pub block_ack_policy_timeout_ms: u64,

    /// Data bursting under an immediate block-ack agreement.
    #[serde(alias = "enableImmediateBAAgreement")]
    pub enable_data_bursting: bool,

    #[serde(alias = "enableDelayedBAAgreement")]
    pub enable_delayed_ba: bool,

    #[serde(alias = "rifsMode")]
    pub rifs_mode: bool,

    #[serde(default = "default_short_retry_limit")]
    pub short_retry_limit: u8,

    #[serde(default = "default_long_retry_limit")]
    pub long_retry_limit: u8,

    /// Frames strictly larger than this use RTS/CTS and the long retry counter.
    #[serde(default = "default_rts_threshold")]
    pub rts_threshold: usize,

    /// Frames larger than this would need fragmentation, which the MAC does not perform.
    #[serde(default = "default_fragmentation_threshold")]
    pub fragmentation_threshold: usize,

    pub edca: EdcaTable,

    /// Seed of the backoff and sub-frame corruption random stream.
    pub rng_seed: u64,
}

impl Default for Dot11nConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            enable_amsdu: false,
            enable_big_amsdu: false,
            enable_ampdu: false,
            ampdu_length_exponent: 0,
            mac_output_queue_size: default_queue_size(),
            amsdu_buffer_timeout_ms: default_amsdu_timeout(),
            input_buffer_timeout_ms: default_input_timeout(),
            block_ack_policy_timeout_ms: default_bap_timeout(),
            enable_data_bursting: false,
            enable_delayed_ba: false,
            rifs_mode: false,
            short_retry_limit: default_short_retry_limit(),
            long_retry_limit: default_long_retry_limit(),
            rts_threshold: default_rts_threshold(),
            fragmentation_threshold: default_fragmentation_threshold(),
            edca: EdcaTable::default(),
            rng_seed: 0,
        }
    }
}

fn default_queue_size() -> usize {
    80
}

fn default_amsdu_timeout() -> u64 {
    10
}

fn default_input_timeout() -> u64 {
    50
}

fn default_bap_timeout() -> u64 {
    500
}

fn default_short_retry_limit() -> u8 {
    7
}

fn default_long_retry_limit() -> u8 {
    4
}

fn default_rts_threshold() -> usize {
    2347
}

fn default_fragmentation_threshold() -> usize {
    AMPDU_MAX_SIZE
}

impl Dot11nConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Dot11nResult<Self> {
        let data = fs::read_to_string(&path).map_err(Dot11nError::from)?;
        let cfg = toml::from_str::<Dot11nConfig>(&data).map_err(Dot11nError::ConfigParse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load config alias version
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Dot11nResult<Self> {
        Self::from_file(path)
    }

    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> crate::Dot11nResult<()> {
        if self.ampdu_length_exponent > 3 {
            return Err(Dot11nError::InvalidConfig(format!(
                "ampdu_length_exponent must be 0..=3, got {}",
                self.ampdu_length_exponent
            )));
        }
        if self.mac_output_queue_size == 0 {
            return Err(Dot11nError::InvalidConfig("mac_output_queue_size must be positive".into()));
        }
        if self.enable_data_bursting && (self.enable_amsdu || self.enable_ampdu) {
            return Err(Dot11nError::InvalidConfig(
                "data bursting cannot be combined with A-MSDU or A-MPDU aggregation".into(),
            ));
        }
        if self.short_retry_limit == 0 || self.long_retry_limit == 0 {
            return Err(Dot11nError::InvalidConfig("retry limits must be positive".into()));
        }
        if self.enable_amsdu && self.fragmentation_threshold < self.max_amsdu_size() + QOS_MPDU_OVERHEAD {
            return Err(Dot11nError::InvalidConfig(format!(
                "fragmentation_threshold {} is below the largest A-MSDU frame {}",
                self.fragmentation_threshold,
                self.max_amsdu_size() + QOS_MPDU_OVERHEAD
            )));
        }
        for ac in AccessCategory::ALL {
            let p = self.edca.get(ac);
            if p.cw_min > p.cw_max {
                return Err(Dot11nError::InvalidConfig(format!("{} cw_min exceeds cw_max", ac.label())));
            }
        }
        Ok(())
    }

    /// Local A-MSDU size limit.
    #[must_use]
    pub fn max_amsdu_size(&self) -> usize {
        if self.enable_big_amsdu { AMSDU_SIZE_2 } else { AMSDU_SIZE_1 }
    }

    /// Local A-MPDU length limit derived from the length exponent.
    #[must_use]
    pub fn max_ampdu_length(&self) -> usize {
        max_ampdu_length_for(self.ampdu_length_exponent)
    }

    #[must_use]
    pub fn amsdu_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.amsdu_buffer_timeout_ms)
    }

    #[must_use]
    pub fn input_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.input_buffer_timeout_ms)
    }

    #[must_use]
    pub fn block_ack_policy_timeout(&self) -> Duration {
        Duration::from_millis(self.block_ack_policy_timeout_ms)
    }

    /// Watch the configuration file for changes and receive updates through a watch channel.
    ///
    /// Returns the initial configuration and a [`watch::Receiver`] that yields a new
    /// [`Dot11nConfig`] wrapped in [`Arc`] every time the file is modified on disk. Updates
    /// that fail to parse or validate are skipped.
    pub fn watch_file<P: AsRef<Path>>(path: P) -> crate::Dot11nResult<(Arc<Dot11nConfig>, watch::Receiver<Arc<Dot11nConfig>>)> {
        let path_buf = path.as_ref().to_path_buf();
        let initial_cfg = Arc::new(Self::from_file(&path_buf)?);
        let path_in_closure = path_buf.clone();
        let (tx, rx) = watch::channel::<Arc<Dot11nConfig>>(initial_cfg.clone());

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: NotifyResult<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_)) {
                    match Self::from_file(&path_in_closure) {
                        Ok(updated) => {
                            let _ = tx.send(Arc::new(updated));
                        }
                        Err(e) => tracing::warn!(error = %e, "ignoring invalid configuration update"),
                    }
                }
            }
        })?;

        watcher.watch(&path_buf, RecursiveMode::NonRecursive)?;
        // The watcher must outlive every receiver; it runs for the rest of the process.
        std::mem::forget(watcher);

        Ok((initial_cfg, rx))
    }
}

/// A-MPDU length limit for a given exponent, capped at 65535 bytes.
#[must_use]
pub fn max_ampdu_length_for(exponent: u8) -> usize {
    let raw = (1usize << (13 + u32::from(exponent.min(3)))) - 1;
    raw.min(AMPDU_MAX_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = Dot11nConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.mac_output_queue_size, 80);
        assert_eq!(cfg.block_ack_policy_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.edca.get(AccessCategory::BestEffort).txop_limit(), None);
        assert_eq!(cfg.edca.get(AccessCategory::Voice).txop_limit(), Some(Duration::from_micros(1504)));
    }

    #[test]
    fn parses_camel_case_aliases() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "isAmsduEnable = true\nenableBigAmsdu = true\nampduLengthExponent = 2\nrifsMode = true").unwrap();
        let cfg = Dot11nConfig::from_file(file.path()).unwrap();
        assert!(cfg.enable_amsdu);
        assert_eq!(cfg.max_amsdu_size(), AMSDU_SIZE_2);
        assert_eq!(cfg.max_ampdu_length(), 32_767);
        assert!(cfg.rifs_mode);
    }

    #[test]
    fn bursting_excludes_aggregation() {
        let cfg = Dot11nConfig { enable_data_bursting: true, enable_ampdu: true, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(Dot11nError::InvalidConfig(_))));
    }

    #[test]
    fn fragmentation_threshold_covers_a_full_amsdu_frame() {
        let body_only = Dot11nConfig { enable_amsdu: true, fragmentation_threshold: AMSDU_SIZE_1, ..Dot11nConfig::default() };
        assert!(matches!(body_only.validate(), Err(Dot11nError::InvalidConfig(_))));

        let framed = Dot11nConfig { fragmentation_threshold: AMSDU_SIZE_1 + QOS_MPDU_OVERHEAD, ..body_only };
        assert!(framed.validate().is_ok());
    }

    #[test]
    fn ampdu_length_is_capped() {
        assert_eq!(max_ampdu_length_for(0), 8191);
        assert_eq!(max_ampdu_length_for(3), 65_535);
    }

    #[test]
    fn rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enable_amsdu = \"yes\"").unwrap();
        assert!(matches!(Dot11nConfig::from_file(file.path()), Err(Dot11nError::ConfigParse(_))));
    }

    #[tokio::test]
    async fn watch_file_yields_initial_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enable_ampdu = true\nmac_output_queue_size = 16").unwrap();
        let (initial, rx) = Dot11nConfig::watch_file(file.path()).unwrap();
        assert!(initial.enable_ampdu);
        assert_eq!(rx.borrow().mac_output_queue_size, 16);
    }

    #[test]
    fn watch_file_rejects_invalid_start() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ampdu_length_exponent = 9").unwrap();
        assert!(matches!(Dot11nConfig::watch_file(file.path()), Err(Dot11nError::InvalidConfig(_))));
    }
}
