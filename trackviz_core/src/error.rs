//! Error types for the TrackViz core.

use thiserror::Error;
use trackviz_env::EnvError;

/// Reading or writing a JSON artifact failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reference path integrity and persistence errors.
#[derive(Debug, Error)]
pub enum PathError {
    /// Not enough samples to resample a full loop
    #[error("Insufficient data: need at least {needed} samples, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// A persisted path does not hold the expected number of points
    #[error("Invalid reference path: expected {expected} points, got {got}")]
    InvalidReferencePath { expected: usize, got: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the pipeline controller and its command surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline already started")]
    AlreadyStarted,

    #[error("No session found for circuit {circuit_key} ({session_name} {year})")]
    NoSessionFound {
        circuit_key: u32,
        session_name: String,
        year: i32,
    },

    #[error("Failed to parse session start time: {0:?}")]
    SessionParseError(String),

    #[error("Upstream failure: {0}")]
    Upstream(#[from] EnvError),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Entity list is empty")]
    EmptyEntityList,

    #[error("Invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

impl PipelineError {
    /// Creates an invalid command error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    /// Returns true for errors caused by the caller's input rather than the
    /// pipeline or its collaborators.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::AlreadyStarted
                | PipelineError::UnknownCommand(_)
                | PipelineError::InvalidCommand(_)
                | PipelineError::EmptyEntityList
                | PipelineError::InvalidEntityId(_)
        )
    }
}
