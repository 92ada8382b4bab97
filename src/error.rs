//! Error types for the worker execution process.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{ActivityRef, TaskKey};

/// Top-level error type for worker startup and serving.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Specification error: {0}")]
    Spec(#[from] SpecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors loading specification bindings.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Failed to read specification bindings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse specification bindings from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Wire-level decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Input {input} populates more than one payload field")]
    ConflictingPayload { input: String },

    #[error("Binary frame is not valid UTF-8")]
    NonUtf8Frame,
}

/// Structural validation failures against a bound specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required inputs for {task}: {}", .missing.join(", "))]
    MissingInputs { task: TaskKey, missing: Vec<String> },

    #[error("Missing required output for {task}: neither result_ref nor result_inline was set")]
    MissingOutput { task: TaskKey },
}

/// Failures scoped to a single assignment. Each becomes an ERROR completion.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("No handler for {task}")]
    NoHandler { task: TaskKey },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The handler's own message, verbatim.
    #[error("{message}")]
    HandlerFailed { message: String },

    #[error("Activity {activity} is already in flight on this session")]
    AlreadyInFlight { activity: ActivityRef },

    #[error("Cancelled before a concurrency slot was acquired")]
    Cancelled,
}

/// Session plumbing failures. These end the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Stream read failed: {0}")]
    Read(String),

    #[error("Stream write failed: {0}")]
    Write(String),

    /// A frame that could neither be decoded nor answered.
    #[error("Undecodable frame: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Work abandoned when the drain grace period ran out. Never sent on the wire;
/// the orchestrator infers it from stream closure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Activity {activity} abandoned after {grace:?} drain grace period")]
pub struct AbandonedError {
    pub activity: ActivityRef,
    pub grace: Duration,
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
