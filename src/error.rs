//! Error taxonomy shared by the registry, dispatcher, executor and plugins.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the tool layer.
///
/// Validation errors (`UnknownFunction`, `InvalidArgument`, `Conflict`) are
/// returned directly to the caller so the model can retry or apologize.
/// Job failures (`ResourceExhausted`, `Internal`) are asynchronous and reach
/// the client only through the terminal job event.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Plugin descriptor failed validation; the plugin is skipped, not fatal.
    #[error("plugin registration failed: {0}")]
    Registration(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// A required parameter is missing or type-mismatched. Always names the
    /// offending parameter.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// Session-state contention, e.g. re-analyzing a document while a prior
    /// analysis job is still running.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Exclusive-device failure (e.g. out-of-memory). The owning job
    /// transitions to Failed; no automatic retry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The capability exists but its backend is not configured or loaded.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code used in error event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registration(_) => "registration_error",
            Self::UnknownFunction(_) => "unknown_function",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Conflict(_) => "conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Structured payload delivered to the client / model.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}
