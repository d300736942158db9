#![forbid(unsafe_code)]

//! Observability for the 802.11n MAC.
//!
//! - [`init_logging`] installs the process-wide `tracing` subscriber, either human readable or
//!   as bunyan JSON lines.
//! - [`create_span`] builds operation spans that the MAC's events nest under.
//! - [`MacMetrics`] mirrors [`MacStats`] snapshots into a Prometheus registry, one label value
//!   per simulated node, and renders the text exposition format.

use std::str::FromStr;

use anyhow::Context;
use dot11n_mac::MacStats;
use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, span, Level};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" | "bunyan" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format `{other}`"),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Fails if a subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level `{level}`"))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .context("installing fmt subscriber")?,
        LogFormat::Json => registry
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new("dot11n".into(), std::io::stdout))
            .try_init()
            .context("installing bunyan subscriber")?,
    }

    debug!(?format, level, "logging initialised");
    Ok(())
}

/// Create a tracing span for MAC operations.
pub fn create_span(name: &str, operation: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "dot11n_operation",
        operation = operation,
        operation_name = name,
    )
}

type Extract = fn(&MacStats) -> u64;

const COUNTERS: &[(&str, &str, Extract)] = &[
    ("pkts_sent_unicast", "Unicast MSDUs acknowledged by the peer", |s| s.pkts_sent_unicast),
    ("pkts_sent_broadcast", "Group-addressed MSDUs transmitted", |s| s.pkts_sent_broadcast),
    ("pkts_received", "MSDUs handed to the network layer", |s| s.pkts_received),
    ("pkts_dropped_dcf", "Frames dropped at the retry limit", |s| s.pkts_dropped_dcf),
    ("pkts_purged_delba", "Frames purged by a block-ack teardown", |s| s.pkts_purged_delba),
    ("pkts_rejected_queue_full", "Packets left upstream because the flow was full", |s| {
        s.pkts_rejected_queue_full
    }),
    ("amsdus_created", "A-MSDUs built from staged MSDUs", |s| s.amsdus_created),
    ("amsdus_received", "A-MSDUs unpacked on receive", |s| s.amsdus_received),
    ("ampdus_sent", "A-MPDUs transmitted", |s| s.ampdus_sent),
    ("ampdus_received", "A-MPDUs received", |s| s.ampdus_received),
    ("subframes_corrupted", "A-MPDU sub-frames lost to bit errors", |s| s.subframes_corrupted),
    ("ba_agreements_established", "Block-ack agreements accepted", |s| {
        s.ba_agreements_established
    }),
    ("ba_agreements_rejected", "Block-ack agreements refused by the peer", |s| {
        s.ba_agreements_rejected
    }),
    ("addba_timeouts", "ADDBA requests that went unanswered", |s| s.addba_timeouts),
    ("delba_sent", "DELBA frames queued", |s| s.delba_sent),
    ("delba_received", "DELBA frames processed", |s| s.delba_received),
    ("bar_sent", "Block-ack requests transmitted", |s| s.bar_sent),
    ("ba_received", "Block acks processed", |s| s.ba_received),
    ("ba_sent", "Block acks transmitted", |s| s.ba_sent),
    ("seq_mismatch_drops", "Frames outside the receive window", |s| s.seq_mismatch_drops),
    ("duplicate_drops", "Duplicate frames discarded by reordering", |s| s.duplicate_drops),
    ("internal_collisions", "EDCA internal collisions", |s| s.internal_collisions),
    ("retransmissions", "Frames sent again after a failure", |s| s.retransmissions),
];

/// Prometheus view of one or more MACs' statistics.
pub struct MacMetrics {
    registry: Registry,
    gauges: Vec<(IntGaugeVec, Extract)>,
}

impl std::fmt::Debug for MacMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacMetrics").field("series", &self.gauges.len()).finish()
    }
}

impl MacMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("dot11n".into()), None)?;
        let mut gauges = Vec::with_capacity(COUNTERS.len());
        for &(name, help, extract) in COUNTERS {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["node"])?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.push((gauge, extract));
        }
        Ok(Self { registry, gauges })
    }

    /// Record the latest counters of `node`. Values are set, not added, so repeated snapshots
    /// of the same MAC are idempotent.
    pub fn observe(&self, node: &str, stats: &MacStats) {
        for (gauge, extract) in &self.gauges {
            gauge
                .with_label_values(&[node])
                .set(i64::try_from(extract(stats)).unwrap_or(i64::MAX));
        }
    }

    /// Forget a node's series.
    pub fn remove(&self, node: &str) {
        for (gauge, _) in &self.gauges {
            let _ = gauge.remove_label_values(&[node]);
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered series.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not utf-8")
    }
}

static METRICS: OnceCell<MacMetrics> = OnceCell::new();

/// Process-wide metrics instance, created on first use.
pub fn metrics() -> prometheus::Result<&'static MacMetrics> {
    METRICS.get_or_try_init(MacMetrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_counter_is_registered() {
        let metrics = MacMetrics::new().unwrap();
        metrics.observe("a", &MacStats::default());
        assert_eq!(metrics.registry().gather().len(), COUNTERS.len());
    }

    #[test]
    fn span_creation() {
        let span = create_span("aggregate", "ampdu");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "dot11n_operation");
        }
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn bad_level_is_rejected() {
        std::env::remove_var("RUST_LOG");
        assert!(init_logging("dot11n_mac=notalevel", LogFormat::Pretty).is_err());
    }
}
