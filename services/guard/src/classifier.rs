//! Packet classification
//!
//! Turns captured bytes into a [`PacketDescriptor`] and buckets it with the
//! active [`SignatureTable`]. Anything that cannot be parsed is
//! `Unclassified`; classification never fails.

use crate::packet::{Direction, PacketDescriptor};
use crate::signature::{SignatureTable, TrafficClass};
use parking_lot::RwLock;
use sessionguard_common::error::Result;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Classification of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: TrafficClass,
    /// Parsed metadata, absent for malformed packets
    pub descriptor: Option<PacketDescriptor>,
}

impl Classification {
    /// Remote endpoint of the packet, if it could be parsed
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.descriptor.map(|d| d.remote_addr())
    }

    pub fn is_malformed(&self) -> bool {
        self.descriptor.is_none()
    }
}

/// Classifier over a hot-swappable signature table
#[derive(Debug)]
pub struct PacketClassifier {
    table: RwLock<Arc<SignatureTable>>,
}

impl PacketClassifier {
    pub fn new(table: SignatureTable) -> Result<Self> {
        table.validate()?;
        Ok(Self {
            table: RwLock::new(Arc::new(table)),
        })
    }

    /// Table currently in use
    pub fn table(&self) -> Arc<SignatureTable> {
        Arc::clone(&self.table.read())
    }

    /// Install a new table. Packets already being classified finish with the
    /// table they started with.
    pub fn replace_table(&self, table: SignatureTable) -> Result<()> {
        table.validate()?;
        let version = table.version.clone();
        let entries = table.len();
        let previous = std::mem::replace(&mut *self.table.write(), Arc::new(table));
        info!(
            from = %previous.version,
            to = %version,
            entries,
            "Replaced signature table"
        );
        Ok(())
    }

    /// Classify parsed metadata
    pub fn classify(&self, desc: &PacketDescriptor) -> TrafficClass {
        let table = self.table();
        let class = table.classify(
            desc.direction,
            desc.protocol,
            desc.src_port,
            desc.dst_port,
            desc.payload_len,
        );
        trace!(
            remote = %desc.remote_addr(),
            len = desc.payload_len,
            class = %class,
            "Classified packet"
        );
        class
    }

    /// Parse and classify raw captured bytes
    pub fn classify_raw(&self, direction: Direction, data: &[u8]) -> Classification {
        match PacketDescriptor::parse(direction, data) {
            Ok(desc) => Classification {
                class: self.classify(&desc),
                descriptor: Some(desc),
            },
            Err(e) => {
                debug!(direction = %direction, len = data.len(), error = %e, "Unparseable packet");
                Classification {
                    class: TrafficClass::Unclassified,
                    descriptor: None,
                }
            }
        }
    }
}

impl Default for PacketClassifier {
    fn default() -> Self {
        Self {
            table: RwLock::new(Arc::new(SignatureTable::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;
    use crate::signature::{LengthRange, PortPredicate, SignatureEntry, DEFAULT_GAME_PORT};
    use crate::tests::test_utils::{create_ipv4_packet, inbound_udp};
    use std::net::Ipv4Addr;

    fn scenario_table() -> SignatureTable {
        let entry = |class, min, max| SignatureEntry {
            class,
            direction: Direction::Inbound,
            protocol: Protocol::Udp,
            ports: PortPredicate::Any,
            length: LengthRange::new(min, max),
        };
        SignatureTable::new(
            "scenario",
            vec![
                entry(TrafficClass::Heartbeat, 52, 60),
                entry(TrafficClass::Matchmaking, 100, 120),
                entry(TrafficClass::SessionData, 200, 800),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_classify_raw_buckets() {
        let classifier = PacketClassifier::new(scenario_table()).unwrap();

        let heartbeat = classifier.classify_raw(Direction::Inbound, &inbound_udp("203.0.113.9", 55));
        assert_eq!(heartbeat.class, TrafficClass::Heartbeat);
        assert_eq!(heartbeat.remote_addr(), Some("203.0.113.9".parse().unwrap()));

        let data = classifier.classify_raw(Direction::Inbound, &inbound_udp("203.0.113.9", 400));
        assert_eq!(data.class, TrafficClass::SessionData);

        let unknown = classifier.classify_raw(Direction::Inbound, &inbound_udp("203.0.113.9", 900));
        assert_eq!(unknown.class, TrafficClass::Unclassified);
        assert!(!unknown.is_malformed());
    }

    #[test]
    fn test_malformed_is_unclassified() {
        let classifier = PacketClassifier::default();
        let result = classifier.classify_raw(Direction::Inbound, &[0x45, 0x00, 0x01]);
        assert_eq!(result.class, TrafficClass::Unclassified);
        assert!(result.is_malformed());
        assert_eq!(result.remote_addr(), None);
    }

    #[test]
    fn test_empty_udp_payload_is_unclassified() {
        let classifier = PacketClassifier::default();
        let raw = create_ipv4_packet(
            Ipv4Addr::new(203, 0, 113, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            40000,
            DEFAULT_GAME_PORT,
            &[],
            false,
        );
        let result = classifier.classify_raw(Direction::Inbound, &raw);
        assert_eq!(result.class, TrafficClass::Unclassified);
        assert!(!result.is_malformed());
    }

    #[test]
    fn test_replace_table() {
        let classifier = PacketClassifier::default();
        let raw = inbound_udp("198.51.100.4", 55);
        assert_eq!(
            classifier.classify_raw(Direction::Inbound, &raw).class,
            TrafficClass::SessionData
        );

        classifier.replace_table(scenario_table()).unwrap();
        assert_eq!(classifier.table().version, "scenario");
        assert_eq!(
            classifier.classify_raw(Direction::Inbound, &raw).class,
            TrafficClass::Heartbeat
        );
    }

    #[test]
    fn test_replace_table_rejects_invalid() {
        let classifier = PacketClassifier::default();
        let bad = SignatureTable {
            version: String::new(),
            entries: Vec::new(),
        };
        assert!(classifier.replace_table(bad).is_err());
        assert_eq!(classifier.table().version, "default-1");
    }
}
