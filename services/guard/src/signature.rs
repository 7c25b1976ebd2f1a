//! Traffic signature table
//!
//! Payloads are encrypted, so the only stable signal is size, direction and
//! port. The table maps those to a [`TrafficClass`]. Entries are evaluated in
//! declaration order and the first match wins; overlapping length ranges are
//! how near-identical sizes are told apart (exact heartbeat sizes are listed
//! before the broad session-data range).

use crate::packet::{Direction, Protocol};
use serde::{Deserialize, Serialize};
use sessionguard_common::error::{Error, Result};
use std::fmt;
use std::ops::RangeInclusive;

/// Game session port used by the built-in table
pub const DEFAULT_GAME_PORT: u16 = 6672;

/// Version tag of the built-in table
pub const DEFAULT_TABLE_VERSION: &str = "default-1";

/// Heartbeat payload sizes of the built-in table
pub const HEARTBEAT_SIZES: [usize; 3] = [12, 18, 63];

/// Matchmaking payload sizes of the built-in table
pub const MATCHMAKING_SIZES: [usize; 4] = [191, 207, 223, 239];

/// Largest payload the built-in table accepts as session data
pub const MAX_SESSION_PAYLOAD: usize = 1400;

/// Traffic class assigned to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    Heartbeat,
    Matchmaking,
    SessionData,
    Unclassified,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 4] = [
        TrafficClass::Heartbeat,
        TrafficClass::Matchmaking,
        TrafficClass::SessionData,
        TrafficClass::Unclassified,
    ];

    /// Row index into the admission matrix
    pub const fn index(self) -> usize {
        match self {
            TrafficClass::Heartbeat => 0,
            TrafficClass::Matchmaking => 1,
            TrafficClass::SessionData => 2,
            TrafficClass::Unclassified => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Heartbeat => "heartbeat",
            TrafficClass::Matchmaking => "matchmaking",
            TrafficClass::SessionData => "session_data",
            TrafficClass::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub const fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// Which port an entry looks at. Local and remote are resolved from the
/// packet direction (inbound: local is the destination port).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum PortPredicate {
    #[default]
    Any,
    Local(PortRange),
    Remote(PortRange),
}

impl PortPredicate {
    pub fn matches(&self, direction: Direction, src_port: u16, dst_port: u16) -> bool {
        let (local, remote) = match direction {
            Direction::Inbound => (dst_port, src_port),
            Direction::Outbound => (src_port, dst_port),
        };
        match self {
            PortPredicate::Any => true,
            PortPredicate::Local(range) => range.contains(local),
            PortPredicate::Remote(range) => range.contains(remote),
        }
    }
}

/// Inclusive payload length range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthRange {
    pub min: usize,
    pub max: usize,
}

impl LengthRange {
    pub const fn exact(len: usize) -> Self {
        Self { min: len, max: len }
    }

    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, len: usize) -> bool {
        self.as_range().contains(&len)
    }

    fn as_range(&self) -> RangeInclusive<usize> {
        self.min..=self.max
    }
}

/// One row of the signature table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub class: TrafficClass,
    pub direction: Direction,
    pub protocol: Protocol,
    #[serde(default)]
    pub ports: PortPredicate,
    pub length: LengthRange,
}

impl SignatureEntry {
    pub fn matches(
        &self,
        direction: Direction,
        protocol: Protocol,
        src_port: u16,
        dst_port: u16,
        length: usize,
    ) -> bool {
        self.direction == direction
            && self.protocol == protocol
            && self.length.contains(length)
            && self.ports.matches(direction, src_port, dst_port)
    }
}

/// Ordered, versioned signature table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTable {
    pub version: String,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureTable {
    /// Build and validate a table
    pub fn new(version: impl Into<String>, entries: Vec<SignatureEntry>) -> Result<Self> {
        let table = Self {
            version: version.into(),
            entries,
        };
        table.validate()?;
        Ok(table)
    }

    /// Reject tables that cannot be evaluated meaningfully
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::invalid_signature("table version must not be empty"));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.class == TrafficClass::Unclassified {
                return Err(Error::invalid_signature(format!(
                    "entry {} is tagged unclassified; unmatched packets are unclassified already",
                    i
                )));
            }
            if entry.direction == Direction::Outbound {
                return Err(Error::invalid_signature(format!(
                    "entry {} matches outbound traffic, which is re-injected unclassified",
                    i
                )));
            }
            if entry.length.min > entry.length.max {
                return Err(Error::invalid_signature(format!(
                    "entry {} has inverted length range {}..={}",
                    i, entry.length.min, entry.length.max
                )));
            }
            if let PortPredicate::Local(r) | PortPredicate::Remote(r) = entry.ports {
                if r.min > r.max {
                    return Err(Error::invalid_signature(format!(
                        "entry {} has inverted port range {}..={}",
                        i, r.min, r.max
                    )));
                }
            }
            if let Protocol::Other(n) = entry.protocol {
                return Err(Error::invalid_signature(format!(
                    "entry {} names unsupported transport {}",
                    i, n
                )));
            }
        }
        Ok(())
    }

    /// Classify one packet. Total and side-effect free.
    ///
    /// A zero-length payload is `Unclassified` whatever the table says.
    pub fn classify(
        &self,
        direction: Direction,
        protocol: Protocol,
        src_port: u16,
        dst_port: u16,
        length: usize,
    ) -> TrafficClass {
        if length == 0 {
            return TrafficClass::Unclassified;
        }
        self.entries
            .iter()
            .find(|e| e.matches(direction, protocol, src_port, dst_port, length))
            .map(|e| e.class)
            .unwrap_or(TrafficClass::Unclassified)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SignatureTable {
    /// Inbound UDP on the game port: exact heartbeat sizes, then exact
    /// matchmaking sizes, then everything else up to one MTU as session data.
    fn default() -> Self {
        let ports = PortPredicate::Local(PortRange::single(DEFAULT_GAME_PORT));
        let entry = |class, length| SignatureEntry {
            class,
            direction: Direction::Inbound,
            protocol: Protocol::Udp,
            ports,
            length,
        };

        let mut entries = Vec::new();
        entries.extend(
            HEARTBEAT_SIZES
                .iter()
                .map(|&n| entry(TrafficClass::Heartbeat, LengthRange::exact(n))),
        );
        entries.extend(
            MATCHMAKING_SIZES
                .iter()
                .map(|&n| entry(TrafficClass::Matchmaking, LengthRange::exact(n))),
        );
        entries.push(entry(
            TrafficClass::SessionData,
            LengthRange::new(1, MAX_SESSION_PAYLOAD),
        ));

        Self {
            version: DEFAULT_TABLE_VERSION.to_string(),
            entries,
        }
    }
}
