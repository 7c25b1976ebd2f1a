//! SessionGuard Common Library
//!
//! Configuration, errors, metrics and logging shared by the guard crates.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
