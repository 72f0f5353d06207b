//! Unified error taxonomy for task execution (spec §7 "Error Handling Design").
//!
//! `TaskError` is the single funnel every executor, adapter, and service
//! error converges on before `handleError` decides whether to repair,
//! cancel, or fail the task. Per-adapter errors stay narrow at their own
//! boundary and convert into the nearest `TaskError` variant via `From`.

use thiserror::Error;

/// Convenience alias used throughout services and ports.
pub type DomainResult<T> = Result<T, TaskError>;

/// What kind of repair, if any, a `TaskError` is eligible for (spec §4.6/§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    /// Repaired via the code-generation path (bad API usage, bad schema output).
    CodeRepair,
    /// Repaired via the security-oriented path (policy rejected the script).
    SecurityRepair,
    /// Repaired via the compile-fix path, attempted at most once.
    CompileRepair,
}

/// The fixed taxonomy of task-execution errors (spec §7 table).
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    TaskCancelled,

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("rate limit budget exhausted: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("provider returned server error {status}: {message}")]
    Provider5xx { status: u16, message: String },

    #[error("provider client error {status}: {message}")]
    ClientApiError { status: u16, message: String },

    #[error("response did not match the expected format: {0}")]
    FormatError(String),

    #[error("parameters failed schema validation: {0}")]
    ValidationError(String),

    #[error("static policy check rejected the script: {0}")]
    SandboxPolicyError(String),

    #[error("script failed to compile: {0}")]
    CompileError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl TaskError {
    /// Whether this error is eligible for auto-repair, and under what
    /// conditions (spec §7 "Repair?" column).
    pub fn is_repairable(&self, testing: bool) -> bool {
        match self {
            Self::TaskCancelled
            | Self::AuthFailure(_)
            | Self::RateLimited(_)
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::Provider5xx { .. }
            | Self::ValidationError(_) => false,
            Self::ClientApiError { .. } | Self::FormatError(_) | Self::InternalError(_) => testing,
            Self::SandboxPolicyError(_) | Self::CompileError(_) => true,
        }
    }

    /// Which repair path applies, if any (spec §4.6/§4.7).
    pub fn as_repair_kind(&self) -> Option<RepairKind> {
        match self {
            Self::ClientApiError { .. } | Self::FormatError(_) | Self::InternalError(_) => {
                Some(RepairKind::CodeRepair)
            }
            Self::SandboxPolicyError(_) => Some(RepairKind::SecurityRepair),
            Self::CompileError(_) => Some(RepairKind::CompileRepair),
            _ => None,
        }
    }

    /// Classifies a provider HTTP status per spec §7 and the resolved
    /// 4xx-mapping open question (SPEC_FULL.md §9 decision 1): every 4xx
    /// other than 401/403/429 maps to `ClientApiError`, with no special
    /// case for 409/422.
    pub fn from_provider_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::AuthFailure(message),
            429 => Self::RateLimited(message),
            500..=599 => Self::Provider5xx { status, message },
            400..=499 => Self::ClientApiError { status, message },
            _ => Self::InternalError(message),
        }
    }
}

/// Errors surfaced by ambient infrastructure (connections) that are not part
/// of the task-execution taxonomy but still need to participate in it via
/// `From` (spec §2A ambient stack).
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Failed(String),
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl From<ConnectionError> for TaskError {
    fn from(err: ConnectionError) -> Self {
        TaskError::Network(err.to_string())
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::InternalError(format!("storage error: {err}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::FormatError(err.to_string())
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TaskError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            TaskError::from_provider_status(status.as_u16(), err.to_string())
        } else {
            TaskError::Network(err.to_string())
        }
    }
}

/// Configuration-layer errors (spec §2A), not convertible into `TaskError`
/// since they occur before any task exists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    MissingKey(String),
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repairable_respects_testing_flag() {
        let err = TaskError::ClientApiError { status: 400, message: "bad field".into() };
        assert!(err.is_repairable(true));
        assert!(!err.is_repairable(false));
    }

    #[test]
    fn sandbox_policy_and_compile_errors_always_repairable() {
        assert!(TaskError::SandboxPolicyError("disallowed call".into()).is_repairable(false));
        assert!(TaskError::CompileError("parse error".into()).is_repairable(false));
    }

    #[test]
    fn never_repairable_kinds() {
        assert!(!TaskError::TaskCancelled.is_repairable(true));
        assert!(!TaskError::AuthFailure("expired".into()).is_repairable(true));
        assert!(!TaskError::RateLimited("budget".into()).is_repairable(true));
        assert!(!TaskError::ValidationError("missing field".into()).is_repairable(true));
    }

    #[test]
    fn status_mapping_401_403_429() {
        assert!(matches!(TaskError::from_provider_status(401, "x"), TaskError::AuthFailure(_)));
        assert!(matches!(TaskError::from_provider_status(403, "x"), TaskError::AuthFailure(_)));
        assert!(matches!(TaskError::from_provider_status(429, "x"), TaskError::RateLimited(_)));
    }

    #[test]
    fn status_mapping_other_4xx_is_client_api_error() {
        assert!(matches!(
            TaskError::from_provider_status(409, "conflict"),
            TaskError::ClientApiError { status: 409, .. }
        ));
        assert!(matches!(
            TaskError::from_provider_status(422, "unprocessable"),
            TaskError::ClientApiError { status: 422, .. }
        ));
    }

    #[test]
    fn status_mapping_5xx() {
        assert!(matches!(
            TaskError::from_provider_status(503, "unavailable"),
            TaskError::Provider5xx { status: 503, .. }
        ));
    }

    #[test]
    fn repair_kind_mapping() {
        assert_eq!(
            TaskError::ClientApiError { status: 400, message: "x".into() }.as_repair_kind(),
            Some(RepairKind::CodeRepair)
        );
        assert_eq!(
            TaskError::SandboxPolicyError("x".into()).as_repair_kind(),
            Some(RepairKind::SecurityRepair)
        );
        assert_eq!(TaskError::CompileError("x".into()).as_repair_kind(), Some(RepairKind::CompileRepair));
        assert_eq!(TaskError::TaskCancelled.as_repair_kind(), None);
    }
}
