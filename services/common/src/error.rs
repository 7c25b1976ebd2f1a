//! Error types for SessionGuard
//!
//! A single error enum shared by the guard engine and its binary. Packet
//! classification never produces one of these on the hot path: malformed
//! packets are resolved to a drop before an error could escape.

use std::fmt::Display;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SessionGuard
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Packet capture closed")]
    CaptureClosed,

    #[error("Packet capture error: {0}")]
    Capture(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid transition: unknown session mode {0:?}")]
    InvalidTransition(String),

    #[error("Invalid signature table: {0}")]
    InvalidSignature(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a capture unavailable error
    pub fn capture_unavailable<S: Into<String>>(msg: S) -> Self {
        Error::CaptureUnavailable(msg.into())
    }

    /// Create a capture error
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Error::Capture(msg.into())
    }

    /// Create a malformed packet error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedPacket(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition<S: Into<String>>(requested: S) -> Self {
        Error::InvalidTransition(requested.into())
    }

    /// Create an invalid signature error
    pub fn invalid_signature<S: Into<String>>(msg: S) -> Self {
        Error::InvalidSignature(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the error must halt the guard and be surfaced to the operator
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::CaptureUnavailable(_) | Error::InvalidSignature(_)
        )
    }

    /// Check if error was caused by operator input (bad command, bad mode name)
    pub fn is_operator_error(&self) -> bool {
        matches!(self, Error::InvalidTransition(_) | Error::InvalidInput(_))
    }

    /// Get a short error code string for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::CaptureUnavailable(_) => "CAPTURE_UNAVAILABLE",
            Error::CaptureClosed => "CAPTURE_CLOSED",
            Error::Capture(_) => "CAPTURE_ERROR",
            Error::MalformedPacket(_) => "MALFORMED_PACKET",
            Error::InvalidTransition(_) => "INVALID_TRANSITION",
            Error::InvalidSignature(_) => "INVALID_SIGNATURE",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T, E> {
    /// Add context to an error
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C;

    /// Add context to an error with a static message
    fn context<C: Display>(self, context: C) -> Result<T>;
}

impl<T, E: Into<Error>> ErrorContext<T, E> for std::result::Result<T, E> {
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| {
            let err: Error = e.into();
            Error::Internal(format!("{}: {}", context(), err))
        })
    }

    fn context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| {
            let err: Error = e.into();
            Error::Internal(format!("{}: {}", context, err))
        })
    }
}

impl<T> ErrorContext<T, ()> for Option<T> {
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::Internal(context().to_string()))
    }

    fn context<C: Display>(self, context: C) -> Result<T> {
        self.ok_or_else(|| Error::Internal(context.to_string()))
    }
}
