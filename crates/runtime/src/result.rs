//! Invocation requests and the uniform result envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;
use crate::tool::Arguments;

/// Request ID (can be string or number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A decoded tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub id: RequestId,
    pub tool: String,
    pub arguments: Arguments,
}

impl InvocationRequest {
    pub fn new(id: impl Into<RequestId>, tool: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            arguments,
        }
    }
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    UnknownTool,
    InvalidArguments,
    ProtocolError,
    Timeout,
    BackendNotFound,
    BackendPermissionDenied,
    BackendRateLimited,
    BackendUnavailable,
    BackendInvalidRequest,
    InternalError,
    /// The dispatch was cancelled. Never delivered to a client.
    Cancelled,
}

impl FailureKind {
    /// Whether a caller may reasonably retry. Advisory only.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Timeout | Self::BackendRateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "UnknownTool",
            Self::InvalidArguments => "InvalidArguments",
            Self::ProtocolError => "ProtocolError",
            Self::Timeout => "Timeout",
            Self::BackendNotFound => "BackendNotFound",
            Self::BackendPermissionDenied => "BackendPermissionDenied",
            Self::BackendRateLimited => "BackendRateLimited",
            Self::BackendUnavailable => "BackendUnavailable",
            Self::BackendInvalidRequest => "BackendInvalidRequest",
            Self::InternalError => "InternalError",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&BackendError> for FailureKind {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::NotFound(_) => Self::BackendNotFound,
            BackendError::PermissionDenied(_) => Self::BackendPermissionDenied,
            BackendError::RateLimited(_) => Self::BackendRateLimited,
            BackendError::InvalidRequest(_) => Self::BackendInvalidRequest,
            BackendError::Unavailable(_) => Self::BackendUnavailable,
            BackendError::Timeout(_) => Self::Timeout,
            BackendError::Unknown(_) => Self::InternalError,
        }
    }
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    Success {
        payload: Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
        retriable: bool,
    },
}

impl InvocationResult {
    pub fn success(payload: Value) -> Self {
        Self::Success { payload }
    }

    /// A failure whose retriable flag follows the kind.
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            retriable: kind.is_retriable(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl From<BackendError> for InvocationResult {
    fn from(err: BackendError) -> Self {
        let kind = FailureKind::from(&err);
        Self::failure(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retriable_kinds() {
        assert!(FailureKind::Timeout.is_retriable());
        assert!(FailureKind::BackendRateLimited.is_retriable());
        assert!(!FailureKind::BackendNotFound.is_retriable());
        assert!(!FailureKind::InternalError.is_retriable());
    }

    #[test]
    fn backend_error_classification() {
        let result = InvocationResult::from(BackendError::Unknown("boom".into()));
        assert_eq!(result.failure_kind(), Some(FailureKind::InternalError));

        let result = InvocationResult::from(BackendError::Timeout("run 9 still RUNNING".into()));
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));

        let result = InvocationResult::from(BackendError::RateLimited("429".into()));
        assert_eq!(
            result,
            InvocationResult::Failure {
                kind: FailureKind::BackendRateLimited,
                message: "rate limited: 429".into(),
                retriable: true,
            }
        );
    }

    #[test]
    fn request_id_roundtrips_untagged() {
        let id: RequestId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(id, RequestId::Number(7));
        let id: RequestId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(id.to_string(), "abc");
    }
}
