//! Trusted address store
//!
//! Read on every inbound session-data packet while the control surface edits
//! it. Every mutation happens under one write lock, so a reader sees either
//! the whole edit or none of it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info};

/// One trusted address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub address: IpAddr,
    pub label: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Seed entry handed to [`WhitelistStore::load`] by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistSeed {
    pub address: IpAddr,
    #[serde(default)]
    pub label: Option<String>,
}

/// Set of trusted addresses keyed by address
#[derive(Debug, Default)]
pub struct WhitelistStore {
    entries: RwLock<BTreeMap<IpAddr, WhitelistEntry>>,
}

impl WhitelistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address. Re-adding an existing address is a no-op.
    ///
    /// Returns true when the address was not present before.
    pub fn add(&self, address: IpAddr) -> bool {
        self.add_labeled(address, None)
    }

    /// Add an address with a human label. An existing entry keeps its
    /// original label and timestamp.
    pub fn add_labeled(&self, address: IpAddr, label: Option<String>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&address) {
            debug!(address = %address, "Address already whitelisted");
            return false;
        }
        entries.insert(
            address,
            WhitelistEntry {
                address,
                label: label.clone(),
                added_at: Utc::now(),
            },
        );
        drop(entries);

        info!(address = %address, label = ?label, "Whitelisted address");
        true
    }

    /// Remove an address. Removing a non-member is a no-op.
    pub fn remove(&self, address: &IpAddr) -> bool {
        let removed = self.entries.write().remove(address).is_some();
        if removed {
            info!(address = %address, "Removed address from whitelist");
        }
        removed
    }

    /// Membership test for the packet path. O(log n), one short read lock.
    pub fn contains(&self, address: &IpAddr) -> bool {
        self.entries.read().contains_key(address)
    }

    /// Whitelisted addresses in ascending order
    pub fn list(&self) -> Vec<IpAddr> {
        self.entries.read().keys().copied().collect()
    }

    /// Full entries, for the persistence layer
    pub fn entries(&self) -> Vec<WhitelistEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn get(&self, address: &IpAddr) -> Option<WhitelistEntry> {
        self.entries.read().get(address).cloned()
    }

    /// Startup hook: merge persisted entries into the store in one step.
    ///
    /// Returns the number of addresses that were new.
    pub fn load<I>(&self, seeds: I) -> usize
    where
        I: IntoIterator<Item = WhitelistSeed>,
    {
        let now = Utc::now();
        let mut added = 0;
        {
            let mut entries = self.entries.write();
            for seed in seeds {
                entries.entry(seed.address).or_insert_with(|| {
                    added += 1;
                    WhitelistEntry {
                        address: seed.address,
                        label: seed.label,
                        added_at: now,
                    }
                });
            }
        }
        info!(added, total = self.len(), "Loaded whitelist entries");
        added
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
