//! Guard configuration
//!
//! Read from the `guard` section of the layered service configuration.

use crate::service_ranges::{ServiceRanges, DEFAULT_SERVICE_RANGES};
use crate::signature::{SignatureTable, DEFAULT_GAME_PORT};
use crate::whitelist::WhitelistSeed;
use serde::Deserialize;
use sessionguard_common::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Capture backend that runs the guard against an in-process queue
pub const LOOPBACK_BACKEND: &str = "loopback";

#[derive(Debug, Clone, Deserialize)]
pub struct GuardSettings {
    /// How recently a peer must have sent admitted session data to be kept
    /// by a locked snapshot
    #[serde(default = "default_activity_window_secs")]
    pub activity_window_secs: u64,

    #[serde(default = "default_max_tracked_peers")]
    pub max_tracked_peers: usize,

    /// Capture receive timeout; bounds how long a stop request waits
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub capture: CaptureSettings,

    /// Inline signature table
    #[serde(default)]
    pub signatures: Option<SignatureTable>,

    /// Path to a signature table file
    #[serde(default)]
    pub signature_file: Option<PathBuf>,

    /// Initial whitelist
    #[serde(default)]
    pub whitelist: Vec<WhitelistSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_game_ports")]
    pub game_ports: Vec<u16>,

    /// Networks never intercepted
    #[serde(default = "default_exempt_ranges")]
    pub exempt_ranges: Vec<String>,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_activity_window_secs() -> u64 {
    60
}

fn default_max_tracked_peers() -> usize {
    4096
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_backend() -> String {
    LOOPBACK_BACKEND.to_string()
}

fn default_game_ports() -> Vec<u16> {
    vec![DEFAULT_GAME_PORT]
}

fn default_exempt_ranges() -> Vec<String> {
    DEFAULT_SERVICE_RANGES.iter().map(|s| s.to_string()).collect()
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            game_ports: default_game_ports(),
            exempt_ranges: default_exempt_ranges(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            activity_window_secs: default_activity_window_secs(),
            max_tracked_peers: default_max_tracked_peers(),
            poll_interval_ms: default_poll_interval_ms(),
            capture: CaptureSettings::default(),
            signatures: None,
            signature_file: None,
            whitelist: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct Sections {
    #[serde(default)]
    guard: GuardSettings,
}

impl GuardSettings {
    /// Load the `guard` section for a service
    pub fn load(service_name: &str) -> Result<Self> {
        let source = sessionguard_common::config::builder(service_name)?.build()?;
        Self::from_config(source)
    }

    pub fn from_config(source: config::Config) -> Result<Self> {
        let sections: Sections = source.try_deserialize()?;
        let settings = sections.guard;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.activity_window_secs == 0 {
            return Err(Error::invalid_input("guard.activity_window_secs must be positive"));
        }
        if self.max_tracked_peers == 0 {
            return Err(Error::invalid_input("guard.max_tracked_peers must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::invalid_input("guard.poll_interval_ms must be positive"));
        }
        if self.capture.queue_capacity == 0 {
            return Err(Error::invalid_input("guard.capture.queue_capacity must be positive"));
        }
        if self.signatures.is_some() && self.signature_file.is_some() {
            return Err(Error::invalid_signature(
                "set either guard.signatures or guard.signature_file, not both",
            ));
        }
        Ok(())
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The configured signature table, or the built-in one
    pub fn signature_table(&self) -> Result<SignatureTable> {
        let table = match (&self.signatures, &self.signature_file) {
            (Some(table), _) => table.clone(),
            (None, Some(path)) => {
                info!(path = %path.display(), "Loading signature table");
                config::Config::builder()
                    .add_source(config::File::from(path.as_path()))
                    .build()?
                    .try_deserialize::<SignatureTable>()?
            }
            (None, None) => SignatureTable::default(),
        };
        table.validate()?;
        Ok(table)
    }

    pub fn service_ranges(&self) -> Result<ServiceRanges> {
        ServiceRanges::parse(self.capture.exempt_ranges.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::TrafficClass;

    fn from_toml(source: &str) -> Result<GuardSettings> {
        let source = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        GuardSettings::from_config(source)
    }

    #[test]
    fn test_defaults_without_section() {
        let settings = from_toml("service_name = \"sessionguard\"").unwrap();
        assert_eq!(settings.activity_window(), Duration::from_secs(60));
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
        assert_eq!(settings.capture.backend, LOOPBACK_BACKEND);
        assert_eq!(settings.capture.game_ports, vec![6672]);
        assert_eq!(settings.service_ranges().unwrap().len(), 5);
        assert_eq!(settings.signature_table().unwrap(), SignatureTable::default());
    }

    #[test]
    fn test_guard_section() {
        let settings = from_toml(
            r#"
            [guard]
            activity_window_secs = 30
            poll_interval_ms = 20

            [guard.capture]
            game_ports = [6672, 61455]
            exempt_ranges = []

            [[guard.whitelist]]
            address = "203.0.113.8"
            label = "alice"

            [[guard.whitelist]]
            address = "2001:db8::8"
            "#,
        )
        .unwrap();

        assert_eq!(settings.activity_window_secs, 30);
        assert_eq!(settings.capture.game_ports, vec![6672, 61455]);
        assert!(settings.service_ranges().unwrap().is_empty());
        assert_eq!(settings.whitelist.len(), 2);
        assert_eq!(settings.whitelist[0].label.as_deref(), Some("alice"));
        assert_eq!(settings.whitelist[1].label, None);
    }

    #[test]
    fn test_inline_signatures() {
        let settings = from_toml(
            r#"
            [guard.signatures]
            version = "custom-7"

            [[guard.signatures.entries]]
            class = "heartbeat"
            direction = "inbound"
            protocol = "udp"
            length = { min = 52, max = 60 }
            "#,
        )
        .unwrap();

        let table = settings.signature_table().unwrap();
        assert_eq!(table.version, "custom-7");
        assert_eq!(table.entries[0].class, TrafficClass::Heartbeat);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = from_toml("[guard]\npoll_interval_ms = 0").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");

        let settings = from_toml(
            r#"
            [guard.capture]
            exempt_ranges = ["10.0.0.0/99"]
            "#,
        )
        .unwrap();
        assert!(settings.service_ranges().is_err());
    }

    #[test]
    fn test_missing_signature_file_fails() {
        let settings = GuardSettings {
            signature_file: Some(PathBuf::from("/nonexistent/signatures.toml")),
            ..GuardSettings::default()
        };
        assert!(settings.signature_table().is_err());
    }
}
