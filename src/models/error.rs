//! Error types for maskflow.
//!
//! Every failure in the pipeline is fatal at this layer. Each variant carries
//! enough context (stage, identifier, model name) to diagnose the run without
//! inspecting internals.

use std::fmt;
use thiserror::Error;

/// Pipeline stage an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Checkpoint,
    Pairing,
    Dispatch,
    Backend,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Checkpoint => "checkpoint",
            Self::Pairing => "pairing",
            Self::Dispatch => "dispatch",
            Self::Backend => "backend",
        };
        f.write_str(name)
    }
}

/// Top-level error type for maskflow.
#[derive(Debug, Error)]
pub enum MaskflowError {
    // ═══════════════════════════════════════════════════════════════════
    // CHECKPOINT
    // ═══════════════════════════════════════════════════════════════════

    #[error("Checkpoint unavailable for {model} ({variant}): {reason}")]
    CheckpointUnavailable {
        model: String,
        variant: String,
        reason: String,
    },

    #[error("Checkpoint fetch from {location} failed: {reason}")]
    FetchFailed { location: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════
    // PAIRING
    // ═══════════════════════════════════════════════════════════════════

    #[error(
        "Duplicate identifier '{identifier}' at manifest line {line}: '{second}' collides with '{first}'"
    )]
    DuplicateIdentifier {
        identifier: String,
        first: String,
        second: String,
        line: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // DISPATCH
    // ═══════════════════════════════════════════════════════════════════

    #[error("Model '{model}' is not supported (registered backends: {})", .available.join(", "))]
    UnsupportedModel {
        model: String,
        available: Vec<String>,
    },

    #[error("Backend '{backend}' failed on {failed} of {total} records")]
    BackendFailure {
        backend: String,
        failed: usize,
        total: usize,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {context}")]
    Io {
        stage: Stage,
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { stage: Stage, message: String },
}

impl MaskflowError {
    /// Create an IO error with context, attributed to `stage`.
    pub fn io(stage: Stage, context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            stage,
            context: context.into(),
            source,
        }
    }

    /// Create an internal error attributed to `stage`.
    pub fn internal(stage: Stage, message: impl Into<String>) -> Self {
        Self::Internal {
            stage,
            message: message.into(),
        }
    }

    /// Create a fetch failure for a checkpoint location.
    pub fn fetch_failed(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::FetchFailed {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    /// Pipeline stage this error aborted.
    pub fn stage(&self) -> Stage {
        match self {
            Self::CheckpointUnavailable { .. }
            | Self::FetchFailed { .. }
            | Self::Network(_)
            | Self::Timeout(_) => Stage::Checkpoint,
            Self::DuplicateIdentifier { .. } | Self::InvalidInput(_) => Stage::Pairing,
            Self::UnsupportedModel { .. } => Stage::Dispatch,
            Self::BackendFailure { .. } => Stage::Backend,
            Self::Config(_) => Stage::Config,
            Self::Io { stage, .. } | Self::Internal { stage, .. } => *stage,
        }
    }

    /// Check if this error is worth another attempt at the transport level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }
}

/// Result type alias for maskflow.
pub type Result<T> = std::result::Result<T, MaskflowError>;
