//! Session mode state machine
//!
//! Holds the active admission mode and, while `Locked`, the set of peers that
//! were already in the session when the lock was taken. The packet path reads
//! the state under a short read lock; transitions take the write lock.

use crate::signature::TrafficClass;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sessionguard_common::error::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Admission mode of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Session data dropped from everyone
    #[default]
    Solo,
    /// Session data admitted from whitelisted addresses only
    Whitelisted,
    /// Session data admitted from anyone
    Public,
    /// Session data admitted from peers present when the lock was taken
    Locked,
}

impl SessionMode {
    pub const ALL: [SessionMode; 4] = [
        SessionMode::Solo,
        SessionMode::Whitelisted,
        SessionMode::Public,
        SessionMode::Locked,
    ];

    /// Column index into the admission matrix
    pub const fn index(self) -> usize {
        match self {
            SessionMode::Solo => 0,
            SessionMode::Whitelisted => 1,
            SessionMode::Public => 2,
            SessionMode::Locked => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Solo => "solo",
            SessionMode::Whitelisted => "whitelisted",
            SessionMode::Public => "public",
            SessionMode::Locked => "locked",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solo" => Ok(SessionMode::Solo),
            "whitelisted" | "whitelist" => Ok(SessionMode::Whitelisted),
            "public" => Ok(SessionMode::Public),
            "locked" | "lock" => Ok(SessionMode::Locked),
            _ => Err(Error::invalid_transition(s.trim())),
        }
    }
}

/// Recently admitted session-data sources
#[derive(Debug)]
pub struct ActivityTracker {
    peers: DashMap<IpAddr, Instant>,
    window: Duration,
    capacity: usize,
    /// Minimum spacing between prunes triggered from the packet path
    prune_interval: Duration,
    last_prune: Mutex<Option<Instant>>,
    prune_passes: AtomicU64,
}

impl ActivityTracker {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            peers: DashMap::new(),
            window,
            capacity: capacity.max(1),
            prune_interval: window / 4,
            last_prune: Mutex::new(None),
            prune_passes: AtomicU64::new(0),
        }
    }

    /// Note that `peer` was just admitted. When the tracker is full, new
    /// peers are skipped; expired entries are swept at most once per prune
    /// interval from here, otherwise by the periodic [`Self::prune`].
    pub fn record(&self, peer: IpAddr) {
        self.record_at(peer, Instant::now());
    }

    pub(crate) fn record_at(&self, peer: IpAddr, now: Instant) {
        if let Some(mut seen) = self.peers.get_mut(&peer) {
            *seen = now;
            return;
        }
        if self.peers.len() >= self.capacity {
            if self.prune_due(now) {
                self.prune_at(now);
            }
            if self.peers.len() >= self.capacity {
                trace!(peer = %peer, capacity = self.capacity, "Activity tracker full");
                return;
            }
        }
        self.peers.insert(peer, now);
    }

    fn prune_due(&self, now: Instant) -> bool {
        let Some(mut last) = self.last_prune.try_lock() else {
            return false;
        };
        let due = last.map_or(true, |t| now.saturating_duration_since(t) >= self.prune_interval);
        if due {
            *last = Some(now);
        }
        due
    }

    /// Number of sweeps over the tracker so far
    pub fn prune_passes(&self) -> u64 {
        self.prune_passes.load(Ordering::Relaxed)
    }

    /// Peers seen within the window
    pub fn active_peers(&self) -> HashSet<IpAddr> {
        self.active_peers_at(Instant::now())
    }

    pub(crate) fn active_peers_at(&self, now: Instant) -> HashSet<IpAddr> {
        self.peers
            .iter()
            .filter(|e| now.saturating_duration_since(*e.value()) <= self.window)
            .map(|e| *e.key())
            .collect()
    }

    /// Drop peers that fell out of the window
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|_, seen| now.saturating_duration_since(*seen) <= self.window);
        self.prune_passes.fetch_add(1, Ordering::Relaxed);
        let removed = before.saturating_sub(self.peers.len());
        if removed > 0 {
            debug!(removed, remaining = self.peers.len(), "Pruned inactive peers");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Mode plus the locked snapshot, always read and replaced together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub mode: SessionMode,
    /// Peers authorised while `Locked`; empty in every other mode
    pub locked_peers: HashSet<IpAddr>,
    pub since: DateTime<Utc>,
    /// Incremented on every transition
    pub generation: u64,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            mode: SessionMode::default(),
            locked_peers: HashSet::new(),
            since: Utc::now(),
            generation: 0,
        }
    }

    pub fn is_locked_peer(&self, peer: &IpAddr) -> bool {
        self.locked_peers.contains(peer)
    }
}

/// Outcome of a transition, for the control surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionMode,
    pub to: SessionMode,
    pub locked_peers: usize,
    pub generation: u64,
}

/// Process-wide session mode, starting in `Solo`
#[derive(Debug)]
pub struct SessionModeStateMachine {
    state: RwLock<SessionState>,
    activity: ActivityTracker,
}

impl SessionModeStateMachine {
    pub fn new(activity_window: Duration, max_tracked_peers: usize) -> Self {
        Self {
            state: RwLock::new(SessionState::initial()),
            activity: ActivityTracker::new(activity_window, max_tracked_peers),
        }
    }

    pub fn current(&self) -> SessionMode {
        self.state.read().mode
    }

    /// Copy of the state, for display
    pub fn snapshot(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// Switch to `to`. Entering `Locked` freezes the currently active peers
    /// as the authorised set; any other mode clears it.
    pub fn transition(&self, to: SessionMode) -> Transition {
        let mut state = self.state.write();
        let from = state.mode;
        let locked_peers = if to == SessionMode::Locked {
            self.activity.active_peers()
        } else {
            HashSet::new()
        };

        *state = SessionState {
            mode: to,
            locked_peers,
            since: Utc::now(),
            generation: state.generation + 1,
        };

        let transition = Transition {
            from,
            to,
            locked_peers: state.locked_peers.len(),
            generation: state.generation,
        };
        drop(state);

        info!(
            from = %transition.from,
            to = %transition.to,
            locked_peers = transition.locked_peers,
            "Session mode changed"
        );
        transition
    }

    /// Parse an operator-supplied mode name and transition to it. Unknown
    /// names leave the mode unchanged.
    pub fn transition_named(&self, name: &str) -> Result<Transition> {
        let mode = name.parse::<SessionMode>()?;
        Ok(self.transition(mode))
    }

    /// Run one admission decision against a consistent state.
    ///
    /// The read lock is held for the decision and, when session data is
    /// admitted, for recording its source, so a transition never snapshots
    /// between the two.
    pub fn admit<F>(&self, class: TrafficClass, source: Option<IpAddr>, decide: F) -> bool
    where
        F: FnOnce(&SessionState) -> bool,
    {
        let state = self.state.read();
        let allowed = decide(&state);
        if allowed && class == TrafficClass::SessionData {
            if let Some(source) = source {
                self.activity.record(source);
            }
        }
        allowed
    }
}

impl Default for SessionModeStateMachine {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 4096)
    }
}
