//! Operator control surface
//!
//! Mode changes and whitelist edits arrive here from the console, while the
//! filtering loop keeps running on its own thread.

use crate::classifier::PacketClassifier;
use crate::session::{SessionMode, SessionModeStateMachine, Transition};
use crate::whitelist::{WhitelistEntry, WhitelistStore};
use chrono::{DateTime, Utc};
use sessionguard_common::error::{Error, Result};
use sessionguard_common::Metrics;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// A parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Mode(SessionMode),
    Allow {
        address: IpAddr,
        label: Option<String>,
    },
    Revoke(IpAddr),
    List,
    Status,
    Metrics,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  mode <solo|whitelisted|public|locked>
  allow <ip> [label]
  revoke <ip>
  list
  status
  metrics
  quit";

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(Error::invalid_input("empty command"));
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "mode" => {
                let name = words
                    .next()
                    .ok_or_else(|| Error::invalid_input("usage: mode <name>"))?;
                Command::Mode(name.parse()?)
            }
            "allow" | "add" => {
                let address = parse_address(words.next())?;
                let label = words.collect::<Vec<_>>().join(" ");
                Command::Allow {
                    address,
                    label: (!label.is_empty()).then_some(label),
                }
            }
            "revoke" | "remove" => Command::Revoke(parse_address(words.next())?),
            "list" => Command::List,
            "status" => Command::Status,
            "metrics" => Command::Metrics,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(Error::invalid_input(format!("unknown command {:?}", other))),
        };
        Ok(command)
    }
}

fn parse_address(word: Option<&str>) -> Result<IpAddr> {
    let word = word.ok_or_else(|| Error::invalid_input("missing address"))?;
    word.parse()
        .map_err(|_| Error::invalid_input(format!("invalid address {:?}", word)))
}

/// Result of executing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Message(String),
    Quit,
}

/// Guard state as shown to the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardStatus {
    pub mode: SessionMode,
    pub since: DateTime<Utc>,
    pub generation: u64,
    pub locked_peers: usize,
    pub active_peers: usize,
    pub whitelist_entries: usize,
    pub signature_version: String,
}

impl fmt::Display for GuardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode={} since={} generation={} locked_peers={} active_peers={} whitelist={} signatures={}",
            self.mode,
            self.since.to_rfc3339(),
            self.generation,
            self.locked_peers,
            self.active_peers,
            self.whitelist_entries,
            self.signature_version
        )
    }
}

/// Entry point for operator actions
pub struct ControlSurface {
    whitelist: Arc<WhitelistStore>,
    session: Arc<SessionModeStateMachine>,
    classifier: Arc<PacketClassifier>,
    metrics: Metrics,
}

impl ControlSurface {
    pub fn new(
        whitelist: Arc<WhitelistStore>,
        session: Arc<SessionModeStateMachine>,
        classifier: Arc<PacketClassifier>,
        metrics: Metrics,
    ) -> Self {
        Self {
            whitelist,
            session,
            classifier,
            metrics,
        }
    }

    pub fn transition(&self, to: SessionMode) -> Transition {
        let transition = self.session.transition(to);
        self.metrics.record_transition(
            transition.from.as_str(),
            transition.to.as_str(),
            transition.locked_peers,
        );
        transition
    }

    /// Transition by name. Unknown names are rejected and the mode is kept.
    pub fn transition_named(&self, name: &str) -> Result<Transition> {
        let mode = name.parse::<SessionMode>().map_err(|e| {
            warn!(requested = name, current = %self.session.current(), "Rejected mode change");
            e
        })?;
        Ok(self.transition(mode))
    }

    pub fn allow(&self, address: IpAddr, label: Option<String>) -> bool {
        let added = self.whitelist.add_labeled(address, label);
        self.metrics.set_whitelist_size(self.whitelist.len());
        added
    }

    pub fn revoke(&self, address: &IpAddr) -> bool {
        let removed = self.whitelist.remove(address);
        self.metrics.set_whitelist_size(self.whitelist.len());
        removed
    }

    pub fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.whitelist.entries()
    }

    pub fn status(&self) -> GuardStatus {
        let state = self.session.snapshot();
        GuardStatus {
            mode: state.mode,
            since: state.since,
            generation: state.generation,
            locked_peers: state.locked_peers.len(),
            active_peers: self.session.activity().active_peers().len(),
            whitelist_entries: self.whitelist.len(),
            signature_version: self.classifier.table().version.clone(),
        }
    }

    /// Refresh the sampled gauges
    pub fn refresh_gauges(&self) {
        self.session.activity().prune();
        self.metrics
            .set_active_peers(self.session.activity().active_peers().len());
        self.metrics.set_whitelist_size(self.whitelist.len());
    }

    /// Prometheus text exposition of the guard metrics
    pub fn metrics_text(&self) -> String {
        self.refresh_gauges();
        self.metrics.encode()
    }

    pub fn execute(&self, command: Command) -> Reply {
        let message = match command {
            Command::Mode(mode) => {
                let transition = self.transition(mode);
                format!(
                    "mode {} -> {} (locked peers: {})",
                    transition.from, transition.to, transition.locked_peers
                )
            }
            Command::Allow { address, label } => {
                if self.allow(address, label) {
                    format!("allowed {}", address)
                } else {
                    format!("{} is already allowed", address)
                }
            }
            Command::Revoke(address) => {
                if self.revoke(&address) {
                    format!("revoked {}", address)
                } else {
                    format!("{} was not allowed", address)
                }
            }
            Command::List => {
                let entries = self.whitelist();
                if entries.is_empty() {
                    "whitelist is empty".to_string()
                } else {
                    entries
                        .iter()
                        .map(|e| match &e.label {
                            Some(label) => format!("{} ({})", e.address, label),
                            None => e.address.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Command::Status => self.status().to_string(),
            Command::Metrics => self.metrics_text(),
            Command::Help => HELP.to_string(),
            Command::Quit => {
                info!("Quit requested from console");
                return Reply::Quit;
            }
        };
        Reply::Message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> ControlSurface {
        ControlSurface::new(
            Arc::new(WhitelistStore::new()),
            Arc::new(SessionModeStateMachine::default()),
            Arc::new(PacketClassifier::default()),
            Metrics::new(),
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("mode Whitelisted").unwrap(),
            Command::Mode(SessionMode::Whitelisted)
        );
        assert_eq!(
            Command::parse("allow 203.0.113.4 best friend").unwrap(),
            Command::Allow {
                address: ip("203.0.113.4"),
                label: Some("best friend".to_string()),
            }
        );
        assert_eq!(
            Command::parse("  allow 2001:db8::7 ").unwrap(),
            Command::Allow {
                address: ip("2001:db8::7"),
                label: None,
            }
        );
        assert_eq!(
            Command::parse("revoke 203.0.113.4").unwrap(),
            Command::Revoke(ip("203.0.113.4"))
        );
        assert_eq!(Command::parse("status").unwrap(), Command::Status);
        assert_eq!(Command::parse("QUIT").unwrap(), Command::Quit);
    }

    #[test]
    fn test_parse_rejections() {
        assert!(matches!(
            Command::parse("mode party"),
            Err(Error::InvalidTransition(_))
        ));
        assert!(matches!(
            Command::parse("allow not-an-ip"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(Command::parse("allow"), Err(Error::InvalidInput(_))));
        assert!(matches!(Command::parse(""), Err(Error::InvalidInput(_))));
        assert!(matches!(Command::parse("dance"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_mode_name_keeps_mode() {
        let surface = surface();
        surface.transition(SessionMode::Public);
        assert!(surface.transition_named("chaos").is_err());
        assert_eq!(surface.status().mode, SessionMode::Public);
    }

    #[test]
    fn test_execute_whitelist_commands() {
        let surface = surface();
        let reply = surface.execute(Command::parse("allow 203.0.113.4 alice").unwrap());
        assert_eq!(reply, Reply::Message("allowed 203.0.113.4".to_string()));

        let reply = surface.execute(Command::List);
        assert_eq!(reply, Reply::Message("203.0.113.4 (alice)".to_string()));

        let reply = surface.execute(Command::Revoke(ip("203.0.113.4")));
        assert_eq!(reply, Reply::Message("revoked 203.0.113.4".to_string()));
        assert_eq!(surface.status().whitelist_entries, 0);
        assert_eq!(surface.execute(Command::Quit), Reply::Quit);
    }

    #[test]
    fn test_status_and_metrics() {
        let surface = surface();
        surface.allow(ip("198.51.100.1"), None);
        surface.transition(SessionMode::Locked);

        let status = surface.status();
        assert_eq!(status.mode, SessionMode::Locked);
        assert_eq!(status.generation, 1);
        assert_eq!(status.locked_peers, 0);
        assert_eq!(status.signature_version, "default-1");

        let text = surface.metrics_text();
        assert!(text.contains("sessionguard_whitelist_entries 1"));
        assert!(text.contains("sessionguard_mode_transitions_total"));
    }
}
