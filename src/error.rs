//! Error handling for canvis-rs
//!
//! This module defines the crate error type and a Result alias used
//! throughout the library.
//!
//! Protocol-level transfer outcomes (timeout, cancellation, transport and
//! protocol faults) are not crate errors: they are values carried by the
//! transfer itself and delivered through its events. The error type here
//! covers the synchronous failure modes: rejected mutations, unsupported
//! codec requests, configuration and channel problems.

use thiserror::Error;

/// Main error type for canvis-rs operations
#[derive(Error, Debug)]
pub enum CanVisError {
    /// A mutating call was rejected (bad argument or wrong state)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A codec operation was requested for an encoding that cannot support it
    #[error("Type error: {0}")]
    UnsupportedType(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication with the link worker
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CanVisError>,
    },
}

impl CanVisError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CanVisError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for canvis-rs operations
pub type Result<T> = std::result::Result<T, CanVisError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CanVisError::Validation("node id 200 out of range".to_string());
        assert_eq!(err.to_string(), "Validation error: node id 200 out of range");
    }

    #[test]
    fn test_error_with_context() {
        let err = CanVisError::Config("missing field".to_string());
        let with_ctx = err.with_context("Failed to load settings.toml");
        assert!(with_ctx.to_string().contains("Failed to load settings.toml"));
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<()> = Err(CanVisError::UnsupportedType("str".to_string()));
        let with_ctx = result.context("decoding held value");
        assert!(with_ctx.unwrap_err().to_string().contains("decoding held value"));
    }
}
