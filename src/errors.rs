//! Central error taxonomy for the k-NN engine.
//!
//! Only construction-time and admission-time failures surface as errors.
//! Per-item drops (incomparable vectors, filter rejection, expired entries)
//! and deadline exits are absorbed inside the pipeline and never produce an
//! error object.

use thiserror::Error;

/// High-level error categories for metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid configuration or request specification.
    Configuration,
    /// The request was refused before any work started.
    Admission,
    /// The engine's stop signal has fired.
    Shutdown,
}

impl ErrorCategory {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Admission => "admission",
            ErrorCategory::Shutdown => "shutdown",
        }
    }
}

/// Errors surfaced through the `Handle` API.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("invalid request: {field}: {message}")]
    InvalidSpec { field: String, message: String },

    #[error("unknown namespace: {namespace}")]
    UnknownNamespace { namespace: String },

    #[error("dimension mismatch in {namespace}: expected {expected}, got {got}")]
    Dimension {
        namespace: String,
        expected: usize,
        got: usize,
    },

    #[error("capacity exhausted in namespace {namespace}")]
    Capacity { namespace: String },

    #[error("latency budget exceeded: projected {projected_ms}ms > ttl {ttl_ms}ms")]
    LatencyBudget { projected_ms: u64, ttl_ms: u64 },

    #[error("queue full")]
    QueueFull,

    #[error("engine stopped")]
    Stopped,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Configuration { .. } | EngineError::InvalidSpec { .. } => {
                ErrorCategory::Configuration
            }
            EngineError::UnknownNamespace { .. }
            | EngineError::Dimension { .. }
            | EngineError::Capacity { .. }
            | EngineError::LatencyBudget { .. }
            | EngineError::QueueFull => ErrorCategory::Admission,
            EngineError::Stopped => ErrorCategory::Shutdown,
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_spec<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidSpec {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unknown_namespace<S: Into<String>>(namespace: S) -> Self {
        Self::UnknownNamespace {
            namespace: namespace.into(),
        }
    }
}
