//! Unified error handling for Vortec
//!
//! This crate provides a single error type used across all Vortec components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using VortecError
pub type Result<T> = std::result::Result<T, VortecError>;

/// Unified error type for all Vortec operations
#[derive(thiserror::Error, Debug)]
pub enum VortecError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Telemetry Errors
    // ============================================================================
    #[error("Failed to launch telemetry process {program}: {source}")]
    TelemetryLaunch {
        program: PathBuf,
        source: io::Error,
    },

    #[error("Malformed telemetry line: {0}")]
    TelemetryParse(String),

    #[error("Telemetry stream closed")]
    TelemetryStreamClosed,

    #[error("Telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Command Errors
    // ============================================================================
    #[error("Unknown fan: {0}")]
    UnknownFan(String),

    #[error("Invalid {field}: {value} (must be {min}-{max})")]
    InvalidRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    // ============================================================================
    // Safety Errors
    // ============================================================================
    #[error("Safety action '{action}' failed: {reason}")]
    SafetyActionFailed {
        action: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl VortecError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an out-of-range error for a percentage field
    pub fn invalid_percent(field: &'static str, value: i64) -> Self {
        Self::InvalidRange {
            field,
            value,
            min: 0,
            max: 100,
        }
    }

    /// Stable machine-readable kind, used on the command socket
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::FileRead { .. } | Self::FileTooLarge { .. } => "io",
            Self::TelemetryLaunch { .. } => "telemetry_launch",
            Self::TelemetryParse(_) => "telemetry_parse",
            Self::TelemetryStreamClosed => "telemetry_stream_closed",
            Self::TelemetryUnavailable(_) => "telemetry_unavailable",
            Self::Config(_) | Self::JsonParse(_) | Self::InvalidConfig { .. } => "invalid_config",
            Self::UnknownFan(_) => "unknown_fan",
            Self::InvalidRange { .. } => "invalid_range",
            Self::InvalidThresholds(_) => "invalid_thresholds",
            Self::ShuttingDown => "shutting_down",
            Self::SafetyActionFailed { .. } => "safety_action_failed",
            Self::Generic(_) => "generic",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(VortecError::UnknownFan("x".into()).kind(), "unknown_fan");
        assert_eq!(VortecError::invalid_percent("manual_speed", 120).kind(), "invalid_range");
        assert_eq!(VortecError::ShuttingDown.kind(), "shutting_down");
        assert_eq!(VortecError::invalid_config("fans", "empty").kind(), "invalid_config");
    }

    #[test]
    fn test_range_message() {
        let err = VortecError::invalid_percent("manual_speed", -5);
        assert_eq!(err.to_string(), "Invalid manual_speed: -5 (must be 0-100)");
    }

    #[test]
    fn test_telemetry_kinds() {
        assert_eq!(VortecError::TelemetryStreamClosed.kind(), "telemetry_stream_closed");
        assert_eq!(VortecError::TelemetryParse("bad".into()).kind(), "telemetry_parse");
        let err = VortecError::TelemetryUnavailable("restart budget exhausted".into());
        assert_eq!(err.kind(), "telemetry_unavailable");
        assert_eq!(err.to_string(), "Telemetry unavailable: restart budget exhausted");
    }

    #[test]
    fn test_timeout_kind() {
        let err = VortecError::Timeout("safety action after 30s".into());
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "Operation timed out: safety action after 30s");
    }
}
