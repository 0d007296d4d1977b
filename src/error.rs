//! Crate-wide error taxonomy.
//!
//! One enum, one `Result` alias, following the error kinds named in the
//! design doc: validation, read-only refusal, rollback loops, not-found,
//! I/O, corruption warnings, gradient anomalies, and timeouts.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentDbError>;

/// Main error type for the agent substrate.
#[derive(Error, Debug)]
pub enum AgentDbError {
    /// Input out of range, wrong dimensions, duplicate pattern, quality below
    /// the acceptance threshold, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// `add`/`flush` called on a manager opened read-only.
    #[error("refused: manager is read-only")]
    ReadOnlyRefused,

    /// The same checkpoint id was rolled back to twice in a row.
    #[error("rollback loop detected for checkpoint {0}")]
    RollbackLoop(String),

    /// A baseline trajectory/checkpoint or an unknown layer/id was requested.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O errors, surfaced after bounded retry is exhausted.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A post-update gradient step produced NaN/Inf.
    #[error("gradient anomaly in layer {layer}: {detail}")]
    GradientAnomaly { layer: String, detail: String },

    /// A bounded wait (force-training, query slot) expired.
    #[error("timeout exceeded waiting for {0}")]
    TimeoutExceeded(String),

    /// JSON (de)serialization failures.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid path supplied by a caller.
    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    /// Generic error with attached context, chaining an inner cause.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<AgentDbError>,
    },

    /// Catch-all for conditions not covered by a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl AgentDbError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AgentDbError::Validation(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        AgentDbError::Other(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AgentDbError::NotFound(msg.into())
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        AgentDbError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

/// `CorruptionWarning` is intentionally not an error variant: per the design,
/// checksum mismatches and truncated records are logged via `tracing::warn!`
/// and decoding continues with whatever was intact. See `trajectory::format`.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_source() {
        let err = AgentDbError::not_found("layer-1").context("loading weights");
        let msg = format!("{err}");
        assert!(msg.contains("loading weights"));
        assert!(msg.contains("layer-1"));
    }
}
