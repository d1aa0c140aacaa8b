//! Custom error types for the instrument layer.
//!
//! This module defines the primary error type, `InstrumentError`, shared by every
//! transport, protocol codec and control engine in the crate. Using the `thiserror`
//! crate, it provides a centralized and consistent way to report what went wrong on
//! the wire or inside a control loop.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`** / **`NotConnected`** / **`Io`**: the channel to the instrument could not
//!   be opened or broke while in use.
//! - **`Timeout`**: nothing arrived within the connection's configured read window. This is a
//!   normal outcome for a slow or absent instrument.
//! - **`Checksum`**: a framed ASCII response failed its integrity check.
//! - **`Protocol`**: a response had an unexpected shape (wrong length, bad digits, mismatched
//!   parameter number, ...).
//! - **`DeviceReported`**: the instrument answered, but the answer says it rejected the command.
//! - **`ConvergenceFailure`**: an iterative control loop ran out of iterations.
//! - **`Config`** / **`Configuration`** / **`FeatureNotEnabled`**: setup problems detected
//!   before any byte is sent.
//!
//! Operators need different actions for "unreachable", "rejected" and "did not converge";
//! [`InstrumentError::category`] collapses the variants into those groups.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the instrument error type.
pub type AppResult<T> = std::result::Result<T, InstrumentError>;

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("Connection error on {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Instrument connection is not open")]
    NotConnected,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Checksum error: expected {expected:03}, received '{received}'")]
    Checksum { expected: u8, received: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device reported error: {0}")]
    DeviceReported(String),

    #[error("Did not converge to {target} after {iterations} iterations (last reading: {last_reading:?})")]
    ConvergenceFailure {
        target: f64,
        iterations: u32,
        last_reading: Option<f64>,
    },

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// Coarse grouping of errors by the action an operator has to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Device absent, cable unplugged, socket refused or silent.
    Unreachable,
    /// Device answered but rejected the command or sent garbage.
    Rejected,
    /// A control loop ran out of iterations before reaching tolerance.
    NotConverged,
    /// The caller stopped the operation.
    Cancelled,
    /// Misconfiguration detected locally; nothing reached the wire.
    Setup,
}

impl InstrumentError {
    pub(crate) fn connection(endpoint: impl ToString, reason: impl ToString) -> Self {
        InstrumentError::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Map this error to the operator-facing category.
    pub fn category(&self) -> FailureCategory {
        match self {
            InstrumentError::Connection { .. }
            | InstrumentError::NotConnected
            | InstrumentError::Timeout(_)
            | InstrumentError::Io(_) => FailureCategory::Unreachable,
            InstrumentError::Checksum { .. }
            | InstrumentError::Protocol(_)
            | InstrumentError::DeviceReported(_)
            | InstrumentError::UnsupportedEncoding(_)
            | InstrumentError::OutOfRange(_)
            | InstrumentError::InvalidState(_) => FailureCategory::Rejected,
            InstrumentError::ConvergenceFailure { .. } => FailureCategory::NotConverged,
            InstrumentError::Cancelled => FailureCategory::Cancelled,
            InstrumentError::Config(_)
            | InstrumentError::Configuration(_)
            | InstrumentError::FeatureNotEnabled(_) => FailureCategory::Setup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstrumentError::DeviceReported("BIAS:DEV4 ERROR out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Device reported error: BIAS:DEV4 ERROR out of range"
        );

        let err = InstrumentError::Checksum {
            expected: 7,
            received: "123".into(),
        };
        assert_eq!(err.to_string(), "Checksum error: expected 007, received '123'");
    }

    #[test]
    fn test_categories_separate_operator_actions() {
        assert_eq!(
            InstrumentError::Timeout(Duration::from_millis(500)).category(),
            FailureCategory::Unreachable
        );
        assert_eq!(
            InstrumentError::DeviceReported("ERROR".into()).category(),
            FailureCategory::Rejected
        );
        assert_eq!(
            InstrumentError::ConvergenceFailure {
                target: 0.005,
                iterations: 10,
                last_reading: Some(0.004),
            }
            .category(),
            FailureCategory::NotConverged
        );
        assert_eq!(
            InstrumentError::FeatureNotEnabled("serial".into()).category(),
            FailureCategory::Setup
        );
    }
}
