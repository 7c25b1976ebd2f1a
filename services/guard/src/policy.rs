//! Admission policy
//!
//! The policy is a fixed matrix indexed by (traffic class, session mode).
//! Two cells need a lookup: whitelisted session data and locked session data.
//! `Unclassified` is dropped in every mode.

use crate::session::{SessionMode, SessionModeStateMachine, SessionState};
use crate::signature::TrafficClass;
use crate::whitelist::WhitelistStore;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

/// Final verdict for an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Re-inject the packet unmodified
    Allow,
    /// Discard silently
    Drop,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Drop => "drop",
        }
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Drop
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cell of the admission matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Drop,
    /// Allow iff the source is whitelisted
    IfWhitelisted,
    /// Allow iff the source is in the locked snapshot
    IfLockedPeer,
}

use Admission::{Allow as A, Drop as D, IfLockedPeer as L, IfWhitelisted as W};

/// Rows: heartbeat, matchmaking, session data, unclassified.
/// Columns: solo, whitelisted, public, locked.
pub const ADMISSION_MATRIX: [[Admission; 4]; 4] = [
    [A, A, A, A],
    [A, A, A, A],
    [D, W, A, L],
    [D, D, D, D],
];

/// Matrix cell for a class in a mode
pub const fn admission(class: TrafficClass, mode: SessionMode) -> Admission {
    ADMISSION_MATRIX[class.index()][mode.index()]
}

/// Decides Allow / Drop for classified inbound packets
#[derive(Debug)]
pub struct PolicyEngine {
    whitelist: Arc<WhitelistStore>,
    session: Arc<SessionModeStateMachine>,
}

impl PolicyEngine {
    pub fn new(whitelist: Arc<WhitelistStore>, session: Arc<SessionModeStateMachine>) -> Self {
        Self { whitelist, session }
    }

    pub fn whitelist(&self) -> &Arc<WhitelistStore> {
        &self.whitelist
    }

    pub fn session(&self) -> &Arc<SessionModeStateMachine> {
        &self.session
    }

    /// Pure decision against a given session state.
    ///
    /// A packet without a known source (malformed) never satisfies a lookup.
    pub fn decide(
        &self,
        class: TrafficClass,
        source: Option<IpAddr>,
        state: &SessionState,
    ) -> Decision {
        let decision = match admission(class, state.mode) {
            Admission::Allow => Decision::Allow,
            Admission::Drop => Decision::Drop,
            Admission::IfWhitelisted => {
                Decision::from(source.is_some_and(|ip| self.whitelist.contains(&ip)))
            }
            Admission::IfLockedPeer => {
                Decision::from(source.is_some_and(|ip| state.is_locked_peer(&ip)))
            }
        };
        trace!(class = %class, mode = %state.mode, source = ?source, decision = %decision, "Policy decision");
        decision
    }

    /// Decide against the live session state and record admitted
    /// session-data sources as active peers.
    pub fn admit(&self, class: TrafficClass, source: Option<IpAddr>) -> Decision {
        let allowed = self
            .session
            .admit(class, source, |state| self.decide(class, source, state).is_allow());
        Decision::from(allowed)
    }
}
