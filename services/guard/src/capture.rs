//! Packet capture binding
//!
//! The OS interception driver is an external collaborator. The guard only
//! needs the four operations below; [`ChannelCapture`] implements them
//! in-process for dry runs and tests.

use crate::packet::Direction;
use crate::service_ranges::{AddressBounds, ServiceRanges};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use sessionguard_common::error::{Error, Result};
use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Raw packet as delivered by the capture driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub direction: Direction,
    pub data: Vec<u8>,
}

impl CapturedPacket {
    pub fn new(direction: Direction, data: Vec<u8>) -> Self {
        Self { direction, data }
    }
}

/// An open capture handle
pub trait PacketCapture: Send {
    /// Wait up to `timeout` for the next packet. `Ok(None)` means nothing
    /// arrived; `Err(Error::CaptureClosed)` means the handle is gone.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>>;

    /// Re-inject a packet unmodified
    fn send(&mut self, packet: CapturedPacket) -> Result<()>;

    /// Release the handle. Idempotent.
    fn close(&mut self) -> Result<()>;
}

impl<T: PacketCapture + ?Sized> PacketCapture for Box<T> {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>> {
        (**self).receive(timeout)
    }

    fn send(&mut self, packet: CapturedPacket) -> Result<()> {
        (**self).send(packet)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Opens capture handles for a filter expression
pub trait CaptureProvider {
    fn open(&self, filter: &FilterExpression) -> Result<Box<dyn PacketCapture>>;
}

/// Interception filter handed to the capture driver.
///
/// Narrows interception to UDP with a payload on the game ports and leaves
/// the publisher's service networks alone. The classifier re-validates
/// everything it receives, so this only reduces load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression(String);

impl FilterExpression {
    pub fn build(game_ports: &[u16], exempt: &ServiceRanges) -> Self {
        let mut clauses = vec![
            "(ip or ipv6)".to_string(),
            "udp".to_string(),
            "udp.PayloadLength > 0".to_string(),
        ];

        if !game_ports.is_empty() {
            let ports = game_ports
                .iter()
                .map(|p| format!("udp.DstPort == {p} or udp.SrcPort == {p}"))
                .collect::<Vec<_>>()
                .join(" or ");
            clauses.push(format!("({})", ports));
        }

        for bounds in exempt.bounds() {
            let (field, low, high) = match bounds {
                AddressBounds::V4(low, high) => ("ip", low.to_string(), high.to_string()),
                AddressBounds::V6(low, high) => ("ipv6", low.to_string(), high.to_string()),
            };
            for side in ["SrcAddr", "DstAddr"] {
                clauses.push(format!(
                    "not ({field}.{side} >= {low} and {field}.{side} <= {high})"
                ));
            }
        }

        Self(clauses.join(" and "))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-process capture over bounded channels
pub struct ChannelCapture {
    captured: Receiver<CapturedPacket>,
    reinjected: Sender<CapturedPacket>,
    filter: FilterExpression,
    closed: bool,
}

/// The driver side of a [`ChannelCapture`]: feeds packets in and observes
/// what the guard re-injects.
#[derive(Clone)]
pub struct CaptureTap {
    captured: Sender<CapturedPacket>,
    reinjected: Receiver<CapturedPacket>,
}

impl ChannelCapture {
    pub fn open(filter: &FilterExpression, capacity: usize) -> (Self, CaptureTap) {
        let capacity = capacity.max(1);
        let (captured_tx, captured_rx) = bounded(capacity);
        let (reinjected_tx, reinjected_rx) = bounded(capacity);

        info!(filter = %filter, capacity, "Opened in-process capture");
        (
            Self {
                captured: captured_rx,
                reinjected: reinjected_tx,
                filter: filter.clone(),
                closed: false,
            },
            CaptureTap {
                captured: captured_tx,
                reinjected: reinjected_rx,
            },
        )
    }

    pub fn filter(&self) -> &FilterExpression {
        &self.filter
    }
}

impl PacketCapture for ChannelCapture {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>> {
        if self.closed {
            return Err(Error::CaptureClosed);
        }
        match self.captured.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::CaptureClosed),
        }
    }

    fn send(&mut self, packet: CapturedPacket) -> Result<()> {
        if self.closed {
            return Err(Error::CaptureClosed);
        }
        match self.reinjected.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::capture("re-injection queue full")),
            Err(TrySendError::Disconnected(_)) => Err(Error::CaptureClosed),
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            debug!("Closed in-process capture");
        }
        Ok(())
    }
}

impl CaptureTap {
    /// Hand a raw packet to the guard as if the driver had intercepted it
    pub fn inject(&self, direction: Direction, data: Vec<u8>) -> Result<()> {
        self.captured
            .send(CapturedPacket::new(direction, data))
            .map_err(|_| Error::CaptureClosed)
    }

    /// Next re-injected packet, waiting up to `timeout`
    pub fn next_reinjected(&self, timeout: Duration) -> Option<CapturedPacket> {
        self.reinjected.recv_timeout(timeout).ok()
    }

    /// All re-injected packets currently queued
    pub fn drain_reinjected(&self) -> Vec<CapturedPacket> {
        self.reinjected.try_iter().collect()
    }

    /// Consume re-injected packets on a background thread until the capture
    /// side is dropped. Returns how many were discarded.
    ///
    /// The tap stays alive on that thread, so the capture side does not see
    /// a disconnect while the sink runs.
    pub fn spawn_sink(self) -> io::Result<JoinHandle<u64>> {
        thread::Builder::new()
            .name("loopback-sink".to_string())
            .spawn(move || {
                let mut discarded = 0u64;
                for _ in self.reinjected.iter() {
                    discarded += 1;
                }
                debug!(discarded, "Re-injection sink finished");
                discarded
            })
    }
}

/// Provider for the `loopback` backend. The tap of the most recently opened
/// capture can be taken once.
#[derive(Default)]
pub struct LoopbackProvider {
    capacity: usize,
    tap: parking_lot::Mutex<Option<CaptureTap>>,
}

impl LoopbackProvider {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tap: parking_lot::Mutex::new(None),
        }
    }

    pub fn take_tap(&self) -> Option<CaptureTap> {
        self.tap.lock().take()
    }
}

impl CaptureProvider for LoopbackProvider {
    fn open(&self, filter: &FilterExpression) -> Result<Box<dyn PacketCapture>> {
        let (capture, tap) = ChannelCapture::open(filter, self.capacity);
        *self.tap.lock() = Some(tap);
        Ok(Box::new(capture))
    }
}
