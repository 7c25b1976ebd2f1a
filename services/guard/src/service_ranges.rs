//! Official service networks
//!
//! Traffic to and from the publisher's own infrastructure is excluded from
//! interception entirely (see [`crate::capture::FilterExpression`]).

use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use sessionguard_common::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Publisher networks, EU and US
pub const DEFAULT_SERVICE_RANGES: [&str; 5] = [
    "185.56.64.0/22",
    "104.255.104.0/22",
    "192.81.240.0/22",
    "192.81.244.0/22",
    "198.133.210.0/24",
];

/// First and last address of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressBounds {
    V4(Ipv4Addr, Ipv4Addr),
    V6(Ipv6Addr, Ipv6Addr),
}

/// A collapsed set of CIDR ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRanges {
    networks: Vec<IpNetwork>,
}

impl ServiceRanges {
    /// Parse CIDR strings, dropping ranges covered by another one
    pub fn parse<S: AsRef<str>>(cidrs: &[S]) -> Result<Self> {
        let mut networks = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let cidr = cidr.as_ref().trim();
            let network: IpNetwork = cidr
                .parse()
                .map_err(|e| Error::invalid_input(format!("invalid CIDR {:?}: {}", cidr, e)))?;
            networks.push(network);
        }

        // widest first, so a covering range is kept before its members
        networks.sort_by_key(|n| {
            (
                matches!(n, IpNetwork::V6(_)),
                prefix_len(n),
                n.network_address(),
            )
        });
        let mut collapsed: Vec<IpNetwork> = Vec::with_capacity(networks.len());
        for network in networks {
            if let Some(outer) = collapsed.iter().find(|c| covers(c, &network)) {
                debug!(inner = %network, outer = %outer, "Collapsed service range");
                continue;
            }
            collapsed.push(network);
        }

        Ok(Self {
            networks: collapsed,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|n| network_contains(n, ip))
    }

    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }

    /// Address bounds of every range, for filter rendering
    pub fn bounds(&self) -> Vec<AddressBounds> {
        self.networks.iter().map(bounds).collect()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn prefix_len(network: &IpNetwork) -> u8 {
    match network {
        IpNetwork::V4(n) => n.netmask(),
        IpNetwork::V6(n) => n.netmask(),
    }
}

fn network_contains(network: &IpNetwork, ip: &IpAddr) -> bool {
    match (network, ip) {
        (IpNetwork::V4(n), IpAddr::V4(ip)) => n.contains(*ip),
        (IpNetwork::V6(n), IpAddr::V6(ip)) => n.contains(*ip),
        _ => false,
    }
}

fn covers(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    prefix_len(outer) <= prefix_len(inner) && network_contains(outer, &inner.network_address())
}

fn bounds(network: &IpNetwork) -> AddressBounds {
    match network {
        IpNetwork::V4(n) => v4_bounds(n),
        IpNetwork::V6(n) => v6_bounds(n),
    }
}

fn v4_bounds(n: &Ipv4Network) -> AddressBounds {
    let first = u32::from(n.network_address());
    let host_bits = 32 - u32::from(n.netmask());
    let last = first | 1u32.checked_shl(host_bits).map_or(u32::MAX, |v| v - 1);
    AddressBounds::V4(Ipv4Addr::from(first), Ipv4Addr::from(last))
}

fn v6_bounds(n: &Ipv6Network) -> AddressBounds {
    let first = u128::from(n.network_address());
    let host_bits = 128 - u32::from(n.netmask());
    let last = first | 1u128.checked_shl(host_bits).map_or(u128::MAX, |v| v - 1);
    AddressBounds::V6(Ipv6Addr::from(first), Ipv6Addr::from(last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let ranges = ServiceRanges::parse(&DEFAULT_SERVICE_RANGES).unwrap();
        assert_eq!(ranges.len(), DEFAULT_SERVICE_RANGES.len());
        assert!(ranges.contains(&"185.56.65.20".parse().unwrap()));
        assert!(ranges.contains(&"198.133.210.1".parse().unwrap()));
        assert!(!ranges.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_member_ranges_collapse() {
        let ranges = ServiceRanges::parse(&[
            "185.56.64.0/24",
            "185.56.64.0/22",
            "185.56.65.0/24",
            "185.56.66.0/24",
            "185.56.67.0/24",
        ])
        .unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.networks()[0].to_string(), "185.56.64.0/22");
    }

    #[test]
    fn test_bounds() {
        let ranges = ServiceRanges::parse(&["192.81.240.0/22", "2001:db8::/126"]).unwrap();
        assert_eq!(
            ranges.bounds(),
            vec![
                AddressBounds::V4(
                    "192.81.240.0".parse().unwrap(),
                    "192.81.243.255".parse().unwrap()
                ),
                AddressBounds::V6("2001:db8::".parse().unwrap(), "2001:db8::3".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn test_invalid_cidr() {
        let err = ServiceRanges::parse(&["185.56.64.0/33"]).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(ServiceRanges::parse(&["not-a-network"]).is_err());
    }

    #[test]
    fn test_families_do_not_mix() {
        let ranges = ServiceRanges::parse(&["0.0.0.0/0"]).unwrap();
        assert!(ranges.contains(&"1.2.3.4".parse().unwrap()));
        assert!(!ranges.contains(&"::1".parse().unwrap()));
    }
}
