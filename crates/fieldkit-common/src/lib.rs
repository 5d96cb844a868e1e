//! # FieldKit Common
//!
//! Shared error type, logging setup, and timeout helpers for the FieldKit
//! offline layer.
//!
//! ## Features
//!
//! - Common error type for configuration and timeout failures
//! - Logging configuration and setup
//! - Optional deadlines around async operations

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::{maybe_timeout, with_timeout};

/// Errors shared across FieldKit crates.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Configuration could not be read or was rejected.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Logging could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl CommonError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommonError::Timeout(_))
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CommonError::Config { .. } => "config",
            CommonError::Logging(_) => "logging",
            CommonError::Io(_) => "io",
            CommonError::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;
