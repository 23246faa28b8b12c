use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or querying the tool registry.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A tool with this name is already registered.
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    /// The tool's parameter schema is malformed.
    #[error("invalid schema for tool {tool}: {reason}")]
    InvalidSchema { tool: String, reason: String },

    /// No tool with this name is registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The registry has been sealed; no further registrations are accepted.
    #[error("registry is sealed, cannot register {0}")]
    RegistryClosed(String),
}

/// Errors raised by lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Errors a backend adapter may return.
///
/// Every adapter operation fails with one of these; the dispatch core maps
/// them onto the failure taxonomy before anything reaches a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The operation gave up waiting on the backend.
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Unknown(String),
}

impl BackendError {
    /// The human-readable detail, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::PermissionDenied(m)
            | Self::RateLimited(m)
            | Self::InvalidRequest(m)
            | Self::Unavailable(m)
            | Self::Timeout(m)
            | Self::Unknown(m) => m,
        }
    }

    /// Prefix the message with context, keeping the kind.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{context}: {m}");
        match self {
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::PermissionDenied(m) => Self::PermissionDenied(wrap(m)),
            Self::RateLimited(m) => Self::RateLimited(wrap(m)),
            Self::InvalidRequest(m) => Self::InvalidRequest(wrap(m)),
            Self::Unavailable(m) => Self::Unavailable(wrap(m)),
            Self::Timeout(m) => Self::Timeout(wrap(m)),
            Self::Unknown(m) => Self::Unknown(wrap(m)),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = BackendError::NotFound("job 7".into()).context("run_job");
        assert_eq!(err, BackendError::NotFound("run_job: job 7".into()));
        assert_eq!(err.message(), "run_job: job 7");
    }

    #[test]
    fn backend_error_serializes_tagged() {
        let json = serde_json::to_value(BackendError::RateLimited("slow down".into())).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["message"], "slow down");
    }
}
