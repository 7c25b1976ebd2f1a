//! Filtering loop
//!
//! Pulls packets from the capture handle one at a time and carries each to a
//! complete decision before looking at the stop signal again.

use crate::capture::{CapturedPacket, PacketCapture};
use crate::classifier::PacketClassifier;
use crate::packet::Direction;
use crate::policy::{Decision, PolicyEngine};
use sessionguard_common::error::{Error, Result};
use sessionguard_common::Metrics;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Label used for outbound packets, which are never classified
const PASSTHROUGH_CLASS: &str = "passthrough";

/// Cooperative stop flag, observed between packets
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live loop counters
#[derive(Debug, Default)]
pub struct LoopStats {
    received: AtomicU64,
    inbound: AtomicU64,
    outbound: AtomicU64,
    allowed: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub inbound: u64,
    pub outbound: u64,
    pub allowed: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub send_failures: u64,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            inbound: self.inbound.load(Ordering::Relaxed),
            outbound: self.outbound.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} inbound={} outbound={} allowed={} dropped={} malformed={} send_failures={}",
            self.received,
            self.inbound,
            self.outbound,
            self.allowed,
            self.dropped,
            self.malformed,
            self.send_failures
        )
    }
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    CaptureClosed,
}

/// Summary returned when the loop ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub reason: ExitReason,
    pub stats: StatsSnapshot,
}

/// The packet pump. Owns the capture handle for its whole life.
pub struct FilteringLoop<C: PacketCapture> {
    capture: C,
    classifier: Arc<PacketClassifier>,
    policy: Arc<PolicyEngine>,
    metrics: Metrics,
    stats: Arc<LoopStats>,
    stop: StopSignal,
    poll_interval: Duration,
}

impl<C: PacketCapture> FilteringLoop<C> {
    pub fn new(
        capture: C,
        classifier: Arc<PacketClassifier>,
        policy: Arc<PolicyEngine>,
        metrics: Metrics,
        poll_interval: Duration,
    ) -> Self {
        Self {
            capture,
            classifier,
            policy,
            metrics,
            stats: Arc::new(LoopStats::default()),
            stop: StopSignal::new(),
            poll_interval,
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.stats)
    }

    /// Decide one packet and act on it: re-inject or discard silently.
    ///
    /// Outbound traffic is re-injected without classification.
    pub fn process(&mut self, packet: CapturedPacket) -> Result<Decision> {
        LoopStats::bump(&self.stats.received);

        if packet.direction == Direction::Outbound {
            LoopStats::bump(&self.stats.outbound);
            LoopStats::bump(&self.stats.allowed);
            self.metrics.record_packet(
                Direction::Outbound.as_str(),
                PASSTHROUGH_CLASS,
                Decision::Allow.as_str(),
            );
            self.capture.send(packet)?;
            return Ok(Decision::Allow);
        }

        LoopStats::bump(&self.stats.inbound);
        let classification = self.classifier.classify_raw(Direction::Inbound, &packet.data);
        if classification.is_malformed() {
            LoopStats::bump(&self.stats.malformed);
            self.metrics.record_malformed();
        }

        let decision = self
            .policy
            .admit(classification.class, classification.remote_addr());
        self.metrics.record_packet(
            Direction::Inbound.as_str(),
            classification.class.as_str(),
            decision.as_str(),
        );

        match decision {
            Decision::Allow => {
                LoopStats::bump(&self.stats.allowed);
                self.capture.send(packet)?;
            }
            Decision::Drop => {
                LoopStats::bump(&self.stats.dropped);
                trace!(
                    class = %classification.class,
                    source = ?classification.remote_addr(),
                    "Dropped packet"
                );
            }
        }

        Ok(decision)
    }

    /// Run until stopped or until the capture goes away, then close the
    /// capture handle.
    pub fn run(mut self) -> Result<LoopReport> {
        info!(poll_interval = ?self.poll_interval, "Filtering loop started");

        let outcome = self.pump();

        if let Err(e) = self.capture.close() {
            warn!(error = %e, "Failed to close capture handle");
        }

        let stats = self.stats.snapshot();
        match outcome {
            Ok(reason) => {
                info!(reason = ?reason, %stats, "Filtering loop stopped");
                Ok(LoopReport { reason, stats })
            }
            Err(e) => {
                error!(error = %e, %stats, "Filtering loop failed");
                Err(e)
            }
        }
    }

    fn pump(&mut self) -> Result<ExitReason> {
        loop {
            if self.stop.is_stopped() {
                return Ok(ExitReason::Stopped);
            }

            let packet = match self.capture.receive(self.poll_interval) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(Error::CaptureClosed) => return Ok(ExitReason::CaptureClosed),
                Err(e) => return Err(e),
            };

            match self.process(packet) {
                Ok(_) => {}
                Err(Error::CaptureClosed) => return Ok(ExitReason::CaptureClosed),
                Err(e) => {
                    LoopStats::bump(&self.stats.send_failures);
                    debug!(error = %e, "Failed to re-inject packet");
                }
            }
        }
    }
}
