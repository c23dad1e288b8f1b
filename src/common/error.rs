//! Error types for the step server
//!
//! Errors that reach the test runner are turned into a [`WireError`], whose
//! `exception` field tells the runner whether the server itself rejected the
//! command or a step handler failed.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Exception tag for errors raised by the server while routing a command
pub const EXCEPTION_INTERNAL: &str = "CukeMerlin-internal";

/// Exception tag for errors raised by a step handler
pub const EXCEPTION_EXECUTION: &str = "CukeMerlin-execution";

/// Main error type for the step server
#[derive(Error, Debug)]
pub enum Error {
    // === Protocol Errors ===
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Malformed id tag")]
    MalformedStepId,

    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    // === Routing Errors ===
    #[error("No active scenario. Send begin_scenario first")]
    ScenarioNotActive,

    #[error("Unknown step definition id")]
    UnknownStep { tag: String, ordinal: i64 },

    // === Step Errors ===
    #[error("Step error")]
    StepError,

    #[error("{0}")]
    StepFailed(String),

    #[error("Bad step argument {index}: {reason}")]
    StepArgument { index: usize, reason: String },

    #[error("Unknown connection '{0}'")]
    UnknownLink(String),

    #[error("Not connected")]
    NotConnected,

    #[error("A deferred assertion is already pending")]
    AssertionPending,

    // === Registration Errors ===
    #[error("Invalid step pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Step module '{0}' is already registered")]
    DuplicateModule(String),

    // === Codec Errors ===
    #[error("Event codec error: {0}")]
    Codec(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a step argument error
    pub fn argument(index: usize, reason: impl Into<String>) -> Self {
        Self::StepArgument {
            index,
            reason: reason.into(),
        }
    }

    /// Create a step failure with a runner-visible message
    pub fn step_failed(message: impl Into<String>) -> Self {
        Self::StepFailed(message.into())
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: &str, reason: impl ToString) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error was raised by the server rather than a step handler
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::MalformedCommand(_)
                | Error::MalformedStepId
                | Error::ScenarioNotActive
                | Error::UnknownStep { .. }
                | Error::Internal(_)
        )
    }
}

/// Wire-serializable error for `fail` replies
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WireError {
    pub message: String,
    pub exception: String,
}

impl WireError {
    /// Failure reported by a step handler or a resolved deferred assertion
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exception: EXCEPTION_EXECUTION.to_string(),
        }
    }
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        let exception = if e.is_internal() {
            EXCEPTION_INTERNAL
        } else {
            EXCEPTION_EXECUTION
        };

        Self {
            message: e.to_string(),
            exception: exception.to_string(),
        }
    }
}
