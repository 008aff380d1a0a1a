//! Error types for the TrackViz environment abstraction.

use thiserror::Error;

/// Errors that can occur at the edges of the pipeline.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Upstream request failed (connection refused, non-2xx status, etc.)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Renderer rejected a scene
    #[error("Render error: {0}")]
    Render(String),
}

impl EnvError {
    /// Creates an upstream error.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Creates a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Creates a render error.
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }
}
