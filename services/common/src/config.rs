//! Configuration management for SessionGuard

use serde::Deserialize;
use std::env;

/// Environment variable prefix for overrides (`SESSIONGUARD__TELEMETRY__LOG_LEVEL=debug`)
pub const ENV_PREFIX: &str = "SESSIONGUARD";

/// Base configuration shared by every SessionGuard binary
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Environment (development, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_environment() -> String {
    "development".to_string()
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Current environment name, from `SESSIONGUARD_ENV`
pub fn environment() -> String {
    env::var("SESSIONGUARD_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Layered configuration sources for a service.
///
/// Defaults, then `config/<service>.toml`, then `config/<service>_<env>.toml`,
/// then `SESSIONGUARD__*` environment variables. Service crates deserialize
/// their own sections out of the same builder.
pub fn builder(
    service_name: &str,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    let environment = environment();

    let builder = config::Config::builder()
        // Start with default values
        .set_default("service_name", service_name)?
        .set_default("environment", environment.clone())?
        // Load from config directory
        .add_source(config::File::with_name(&format!("config/{}", service_name)).required(false))
        // Load environment-specific config
        .add_source(
            config::File::with_name(&format!("config/{}_{}", service_name, environment))
                .required(false),
        )
        // Override with environment variables (prefix: SESSIONGUARD__)
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    Ok(builder)
}

impl Config {
    /// Load configuration from environment and files
    pub fn load(service_name: &str) -> Result<Self, config::ConfigError> {
        builder(service_name)?.build()?.try_deserialize()
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Check if running in development
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}
