//! Prometheus metrics for SessionGuard
//!
//! Metrics live in a struct with its own registry so that each guard runtime
//! (and each test) gets an isolated set.

use crate::config::MetricsConfig;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use tracing::error;

/// Label names for metrics
const DIRECTION_LABEL: &str = "direction";
const CLASS_LABEL: &str = "class";
const DECISION_LABEL: &str = "decision";
const FROM_LABEL: &str = "from";
const TO_LABEL: &str = "to";
const MODE_LABEL: &str = "mode";

/// Metrics collector for the guard
#[derive(Clone)]
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // ========================================================================
    // Packet path
    // ========================================================================
    /// Packets handled by the filtering loop
    pub packets_total: IntCounterVec,

    /// Inbound packets whose metadata could not be parsed
    pub malformed_packets_total: IntCounter,

    // ========================================================================
    // Session state
    // ========================================================================
    /// Session mode transitions
    pub mode_transitions_total: IntCounterVec,

    /// Active session mode (1 for the active mode, 0 otherwise)
    pub session_mode: IntGaugeVec,

    /// Whitelist size
    pub whitelist_entries: IntGauge,

    /// Size of the current locked snapshot
    pub locked_peers: IntGauge,

    /// Peers observed sending admitted session data within the activity window
    pub active_peers: IntGauge,

    /// When false, packet counters are skipped and nothing is exposed
    enabled: bool,
}

impl Metrics {
    /// Create a new Metrics instance with all metrics registered
    pub fn new() -> Self {
        Self::new_with_registry(Registry::new())
    }

    /// Create metrics honouring `metrics.enabled`
    pub fn from_config(config: &MetricsConfig) -> Self {
        let mut metrics = Self::new();
        metrics.enabled = config.enabled;
        metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Create metrics with a custom registry
    pub fn new_with_registry(registry: Registry) -> Self {
        let packets_total = IntCounterVec::new(
            Opts::new(
                "sessionguard_packets_total",
                "Packets handled by the filtering loop",
            ),
            &[DIRECTION_LABEL, CLASS_LABEL, DECISION_LABEL],
        )
        .expect("metric creation should succeed");

        let malformed_packets_total = IntCounter::new(
            "sessionguard_malformed_packets_total",
            "Inbound packets with unparseable metadata",
        )
        .expect("metric creation should succeed");

        let mode_transitions_total = IntCounterVec::new(
            Opts::new(
                "sessionguard_mode_transitions_total",
                "Session mode transitions",
            ),
            &[FROM_LABEL, TO_LABEL],
        )
        .expect("metric creation should succeed");

        let session_mode = IntGaugeVec::new(
            Opts::new(
                "sessionguard_session_mode",
                "Active session mode (1 = active)",
            ),
            &[MODE_LABEL],
        )
        .expect("metric creation should succeed");

        let whitelist_entries = IntGauge::new(
            "sessionguard_whitelist_entries",
            "Number of whitelisted addresses",
        )
        .expect("metric creation should succeed");

        let locked_peers = IntGauge::new(
            "sessionguard_locked_peers",
            "Addresses admitted by the current locked snapshot",
        )
        .expect("metric creation should succeed");

        let active_peers = IntGauge::new(
            "sessionguard_active_peers",
            "Peers recently admitted as session data",
        )
        .expect("metric creation should succeed");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(packets_total.clone()),
            Box::new(malformed_packets_total.clone()),
            Box::new(mode_transitions_total.clone()),
            Box::new(session_mode.clone()),
            Box::new(whitelist_entries.clone()),
            Box::new(locked_peers.clone()),
            Box::new(active_peers.clone()),
        ];
        for collector in collectors {
            if let Err(e) = registry.register(collector) {
                error!("Failed to register metric: {}", e);
            }
        }

        Self {
            registry,
            packets_total,
            malformed_packets_total,
            mode_transitions_total,
            session_mode,
            whitelist_entries,
            locked_peers,
            active_peers,
            enabled: true,
        }
    }

    /// Record one packet outcome
    pub fn record_packet(&self, direction: &str, class: &str, decision: &str) {
        if !self.enabled {
            return;
        }
        self.packets_total
            .with_label_values(&[direction, class, decision])
            .inc();
    }

    /// Record a malformed inbound packet
    pub fn record_malformed(&self) {
        if self.enabled {
            self.malformed_packets_total.inc();
        }
    }

    /// Record a mode transition and flip the mode gauge
    pub fn record_transition(&self, from: &str, to: &str, locked_peers: usize) {
        self.mode_transitions_total
            .with_label_values(&[from, to])
            .inc();
        self.set_mode(from, false);
        self.set_mode(to, true);
        self.locked_peers.set(locked_peers as i64);
    }

    /// Set the gauge for one mode
    pub fn set_mode(&self, mode: &str, active: bool) {
        self.session_mode
            .with_label_values(&[mode])
            .set(if active { 1 } else { 0 });
    }

    /// Record the whitelist size
    pub fn set_whitelist_size(&self, size: usize) {
        self.whitelist_entries.set(size as i64);
    }

    /// Record the number of recently active peers
    pub fn set_active_peers(&self, count: usize) {
        self.active_peers.set(count as i64);
    }

    /// Encode metrics in the Prometheus text format
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        if !self.enabled {
            return String::from("# metrics disabled\n");
        }
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::from("# Error encoding metrics\n");
        }

        String::from_utf8(buffer).unwrap_or_else(|e| {
            error!("Metrics output is not valid UTF-8: {}", e);
            String::from("# Error: invalid UTF-8 in metrics\n")
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
