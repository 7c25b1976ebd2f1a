//! Guard runtime
//!
//! Builds the shared state from settings and runs the filtering loop on its
//! own OS thread.

use crate::capture::{
    CaptureProvider, CaptureTap, FilterExpression, LoopbackProvider, PacketCapture,
};
use crate::classifier::PacketClassifier;
use crate::control::ControlSurface;
use crate::filter_loop::{FilteringLoop, LoopReport, LoopStats, StopSignal};
use crate::policy::PolicyEngine;
use crate::service_ranges::ServiceRanges;
use crate::session::{SessionMode, SessionModeStateMachine};
use crate::settings::{GuardSettings, LOOPBACK_BACKEND};
use crate::whitelist::WhitelistStore;
use sessionguard_common::error::{Error, ErrorContext, Result};
use sessionguard_common::Metrics;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// A capture handle opened for the configured backend
pub struct OpenedCapture {
    pub capture: Box<dyn PacketCapture>,
    /// Driver side of an in-process backend
    pub tap: Option<CaptureTap>,
}

/// Shared guard state
pub struct GuardRuntime {
    pub whitelist: Arc<WhitelistStore>,
    pub session: Arc<SessionModeStateMachine>,
    pub classifier: Arc<PacketClassifier>,
    pub policy: Arc<PolicyEngine>,
    pub metrics: Metrics,
    filter: FilterExpression,
    exempt_ranges: ServiceRanges,
    backend: String,
    queue_capacity: usize,
    poll_interval: Duration,
}

impl GuardRuntime {
    pub fn from_settings(settings: &GuardSettings, metrics: Metrics) -> Result<Self> {
        settings.validate()?;

        let classifier = Arc::new(PacketClassifier::new(settings.signature_table()?)?);
        let ranges = settings.service_ranges()?;
        let filter = FilterExpression::build(&settings.capture.game_ports, &ranges);

        let whitelist = Arc::new(WhitelistStore::new());
        let seeded = whitelist.load(settings.whitelist.iter().cloned());

        let session = Arc::new(SessionModeStateMachine::new(
            settings.activity_window(),
            settings.max_tracked_peers,
        ));
        let policy = Arc::new(PolicyEngine::new(
            Arc::clone(&whitelist),
            Arc::clone(&session),
        ));

        metrics.set_mode(SessionMode::default().as_str(), true);
        metrics.set_whitelist_size(whitelist.len());

        info!(
            signatures = %classifier.table().version,
            whitelist = seeded,
            exempt_ranges = ranges.len(),
            "Guard runtime ready"
        );

        let runtime = Self {
            whitelist,
            session,
            classifier,
            policy,
            metrics,
            filter,
            exempt_ranges: ranges,
            backend: settings.capture.backend.clone(),
            queue_capacity: settings.capture.queue_capacity,
            poll_interval: settings.poll_interval(),
        };
        for address in runtime.uncaptured_whitelist() {
            warn!(
                address = %address,
                "Whitelisted address is inside an exempt range and is never intercepted"
            );
        }
        Ok(runtime)
    }

    /// Whitelisted addresses the capture filter excludes from interception
    pub fn uncaptured_whitelist(&self) -> Vec<IpAddr> {
        self.whitelist
            .list()
            .into_iter()
            .filter(|address| self.exempt_ranges.contains(address))
            .collect()
    }

    pub fn filter(&self) -> &FilterExpression {
        &self.filter
    }

    pub fn control(&self) -> ControlSurface {
        ControlSurface::new(
            Arc::clone(&self.whitelist),
            Arc::clone(&self.session),
            Arc::clone(&self.classifier),
            self.metrics.clone(),
        )
    }

    /// Open the configured capture backend.
    ///
    /// The OS interception driver is not bundled; only the in-process
    /// `loopback` backend is available here.
    pub fn open_capture(&self) -> Result<OpenedCapture> {
        match self.backend.as_str() {
            LOOPBACK_BACKEND => {
                let provider = LoopbackProvider::new(self.queue_capacity);
                let capture = provider.open(&self.filter)?;
                Ok(OpenedCapture {
                    capture,
                    tap: provider.take_tap(),
                })
            }
            other => Err(Error::capture_unavailable(format!(
                "no capture backend named {:?}",
                other
            ))),
        }
    }

    /// Start the filtering loop on a dedicated thread
    pub fn start<C>(&self, capture: C) -> Result<GuardHandle>
    where
        C: PacketCapture + 'static,
    {
        let filtering = FilteringLoop::new(
            capture,
            Arc::clone(&self.classifier),
            Arc::clone(&self.policy),
            self.metrics.clone(),
            self.poll_interval,
        );
        let stop = filtering.stop_signal();
        let stats = filtering.stats();

        let thread = thread::Builder::new()
            .name("packet-filter".to_string())
            .spawn(move || filtering.run())
            .context("Failed to spawn filtering thread")?;

        Ok(GuardHandle {
            stop,
            stats,
            thread: Some(thread),
        })
    }
}

/// Handle to a running filtering loop
pub struct GuardHandle {
    stop: StopSignal,
    stats: Arc<LoopStats>,
    thread: Option<JoinHandle<Result<LoopReport>>>,
}

impl GuardHandle {
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the loop to stop after the packet in hand
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop the loop and wait for it to close the capture
    pub fn shutdown(mut self) -> Result<LoopReport> {
        self.stop();
        let thread = self
            .thread
            .take()
            .ok_or_else(|| Error::internal("filtering loop already joined"))?;
        thread
            .join()
            .map_err(|_| Error::internal("filtering loop panicked"))?
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.stop();
            if thread.join().is_err() {
                warn!("Filtering loop panicked");
            }
        }
    }
}
