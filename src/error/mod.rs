//! Error types for Reflow
//!
//! This module defines the main error type used throughout Reflow. Errors are
//! split into three classes (see the crate docs): recoverable-in-component
//! errors that never reach this type, synthetic replay responses carried in
//! the payload stream, and the fatal/configuration errors modeled here.

use thiserror::Error;

/// Result type alias for Reflow operations
pub type Result<T> = std::result::Result<T, ReflowError>;

/// Main error type for Reflow
#[derive(Error, Debug)]
pub enum ReflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Reassembly error: {0}")]
    Reassembly(String),

    #[error("Protocol error: {0}")]
    Proto(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Emitter error: {0}")]
    Emitter(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Output file reached size limit: {0} bytes")]
    FileSizeLimit(i64),

    #[error("Shutting down")]
    ShuttingDown,
}

impl ReflowError {
    /// Create a configuration error with setting context
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        ReflowError::Config(format!("{}: {}", setting, reason.into()))
    }

    /// Create a sink error with operation context
    pub fn sink(operation: &str, detail: impl Into<String>) -> Self {
        ReflowError::Sink(format!("{}: {}", operation, detail.into()))
    }

    /// Create a source error with operation context
    pub fn source(operation: &str, detail: impl Into<String>) -> Self {
        ReflowError::Source(format!("{}: {}", operation, detail.into()))
    }

    /// Create a replay error with operation context
    pub fn replay(operation: &str, detail: impl Into<String>) -> Self {
        ReflowError::Replay(format!("{}: {}", operation, detail.into()))
    }

    /// Returns true if this error should terminate the process.
    ///
    /// Misconfiguration, raw I/O failures, unwritable sink paths and the
    /// output hard cap stop the pipeline; anything else only stops the
    /// task that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReflowError::Config(_)
                | ReflowError::FileSizeLimit(_)
                | ReflowError::Io(_)
                | ReflowError::Sink(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ReflowError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_config_builder() {
        let err = ReflowError::config("output-file", "no writable directory");
        assert_eq!(
            err.to_string(),
            "Configuration error: output-file: no writable directory"
        );
    }

    #[test]
    fn test_sink_builder() {
        let err = ReflowError::sink("rotate", "permission denied");
        assert_eq!(err.to_string(), "Sink error: rotate: permission denied");
    }

    #[test]
    fn test_file_size_limit_display() {
        let err = ReflowError::FileSizeLimit(1024);
        assert_eq!(
            err.to_string(),
            "Output file reached size limit: 1024 bytes"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ReflowError::Config("bad".into()).is_fatal());
        assert!(ReflowError::FileSizeLimit(1).is_fatal());
        assert!(ReflowError::Sink("unwritable".into()).is_fatal());
        assert!(!ReflowError::Emitter("skip".into()).is_fatal());
        assert!(!ReflowError::Replay("pool stopped".into()).is_fatal());
        assert!(!ReflowError::ShuttingDown.is_fatal());
    }
}
