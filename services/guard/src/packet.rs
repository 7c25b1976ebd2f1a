//! Packet descriptors extracted from raw captured bytes

use etherparse::{Ipv4Slice, Ipv6Slice, TcpSlice, UdpSlice};
use serde::{Deserialize, Serialize};
use sessionguard_common::error::{Error, Result};
use std::fmt;
use std::net::IpAddr;

/// Direction of a packet relative to the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// L4 Protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[serde(skip)]
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Other(n) => write!(f, "ip-proto-{}", n),
        }
    }
}

/// Metadata of one intercepted packet.
///
/// Lives only for the duration of a single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub direction: Direction,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Transport payload length in bytes
    pub payload_len: usize,
    pub protocol: Protocol,
}

impl PacketDescriptor {
    /// Parse an IPv4/IPv6 packet carrying UDP or TCP.
    ///
    /// Fragments, truncated headers and other transports are rejected as
    /// malformed: their payload length cannot be trusted.
    pub fn parse(direction: Direction, data: &[u8]) -> Result<Self> {
        let Some(first) = data.first() else {
            return Err(Error::malformed("empty packet"));
        };

        let (src_ip, dst_ip, ip_number, payload) = match first >> 4 {
            4 => {
                let ip = Ipv4Slice::from_slice(data)
                    .map_err(|e| Error::malformed(format!("ipv4: {}", e)))?;
                if ip.payload().fragmented {
                    return Err(Error::malformed("fragmented ipv4 packet"));
                }
                (
                    IpAddr::V4(ip.header().source_addr()),
                    IpAddr::V4(ip.header().destination_addr()),
                    ip.payload().ip_number.0,
                    ip.payload().payload,
                )
            }
            6 => {
                let ip = Ipv6Slice::from_slice(data)
                    .map_err(|e| Error::malformed(format!("ipv6: {}", e)))?;
                if ip.payload().fragmented {
                    return Err(Error::malformed("fragmented ipv6 packet"));
                }
                (
                    IpAddr::V6(ip.header().source_addr()),
                    IpAddr::V6(ip.header().destination_addr()),
                    ip.payload().ip_number.0,
                    ip.payload().payload,
                )
            }
            version => {
                return Err(Error::malformed(format!("unknown ip version {}", version)));
            }
        };

        let protocol = Protocol::from(ip_number);
        let (src_port, dst_port, payload_len) = match protocol {
            Protocol::Udp => {
                let udp = UdpSlice::from_slice(payload)
                    .map_err(|e| Error::malformed(format!("udp: {}", e)))?;
                (udp.source_port(), udp.destination_port(), udp.payload().len())
            }
            Protocol::Tcp => {
                let tcp = TcpSlice::from_slice(payload)
                    .map_err(|e| Error::malformed(format!("tcp: {}", e)))?;
                (tcp.source_port(), tcp.destination_port(), tcp.payload().len())
            }
            Protocol::Other(n) => {
                return Err(Error::malformed(format!("unsupported transport {}", n)));
            }
        };

        Ok(Self {
            direction,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            payload_len,
            protocol,
        })
    }

    /// Address of the remote endpoint
    pub fn remote_addr(&self) -> IpAddr {
        match self.direction {
            Direction::Inbound => self.src_ip,
            Direction::Outbound => self.dst_ip,
        }
    }

    /// Address of the local endpoint
    pub fn local_addr(&self) -> IpAddr {
        match self.direction {
            Direction::Inbound => self.dst_ip,
            Direction::Outbound => self.src_ip,
        }
    }

    pub fn remote_port(&self) -> u16 {
        match self.direction {
            Direction::Inbound => self.src_port,
            Direction::Outbound => self.dst_port,
        }
    }

    pub fn local_port(&self) -> u16 {
        match self.direction {
            Direction::Inbound => self.dst_port,
            Direction::Outbound => self.src_port,
        }
    }
}
