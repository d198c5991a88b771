//! Public error taxonomy for the execution core.

use agentry_state::{ErrorKind, ErrorReport, StorageError};

use crate::sandbox::{SandboxError, SandboxLimits};

/// Errors surfaced by the Function Store, Factory, and Registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed for '{target}': {message}")]
    Validation { target: String, message: String },

    #[error("sandbox violation in '{target}': {message}")]
    SandboxViolation { target: String, message: String },

    #[error("'{target}' exceeded its memory limit of {limit_mb} MB")]
    MemoryLimit { target: String, limit_mb: u64 },

    #[error("'{target}' timed out after {limit_ms}ms")]
    Timeout { target: String, limit_ms: u64 },

    #[error("execution of '{target}' failed: {message}")]
    Execution { target: String, message: String },

    #[error("agent '{agent}' refused at chain depth {depth} (max {max})")]
    ChainDepthExceeded { agent: String, depth: u32, max: u32 },

    /// A cached instance was superseded between resolution and insertion.
    /// Handled inside the registry; callers never see it.
    #[error("cache entry for agent '{agent}' was invalidated while in use")]
    CacheEvictionRace { agent: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn validation(target: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn execution(target: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Execution {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Map a sandbox failure for `target` run under `limits`.
    pub fn from_sandbox(target: &str, error: SandboxError, limits: &SandboxLimits) -> Self {
        match error {
            SandboxError::Syntax { .. } => CoreError::validation(target, error.to_string()),
            SandboxError::Violation { .. } => CoreError::SandboxViolation {
                target: target.to_string(),
                message: error.to_string(),
            },
            SandboxError::MemoryLimit { .. } => CoreError::MemoryLimit {
                target: target.to_string(),
                limit_mb: limits.memory_limit_mb,
            },
            SandboxError::Timeout { limit_ms } => CoreError::Timeout {
                target: target.to_string(),
                limit_ms,
            },
            SandboxError::Runtime { .. } => CoreError::execution(target, error.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } => ErrorKind::Validation,
            CoreError::SandboxViolation { .. } => ErrorKind::SandboxViolation,
            CoreError::MemoryLimit { .. } => ErrorKind::MemoryLimit,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::Execution { .. } | CoreError::Storage(_) => ErrorKind::Execution,
            CoreError::ChainDepthExceeded { .. } => ErrorKind::ChainDepthExceeded,
            CoreError::CacheEvictionRace { .. } => ErrorKind::CacheEvictionRace,
        }
    }

    /// Whether a failed agent may hand this error to its fallback.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Execution | ErrorKind::Timeout | ErrorKind::MemoryLimit
        )
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(error: StorageError) -> Self {
        CoreError::Storage(error.to_string())
    }
}

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sandbox_errors_map_to_public_kinds() {
        let limits = SandboxLimits::new(8, Duration::from_secs(1));
        let cases = [
            (
                SandboxError::Syntax {
                    line: 1,
                    message: "x".into(),
                },
                ErrorKind::Validation,
            ),
            (
                SandboxError::Violation {
                    line: 1,
                    reason: "net".into(),
                },
                ErrorKind::SandboxViolation,
            ),
            (
                SandboxError::MemoryLimit {
                    used_bytes: 10,
                    limit_bytes: 5,
                },
                ErrorKind::MemoryLimit,
            ),
            (SandboxError::Timeout { limit_ms: 1000 }, ErrorKind::Timeout),
            (SandboxError::runtime(3, "boom"), ErrorKind::Execution),
        ];
        for (error, kind) in cases {
            assert_eq!(CoreError::from_sandbox("f", error, &limits).kind(), kind);
        }
    }

    #[test]
    fn test_memory_limit_reports_configured_limit() {
        let limits = SandboxLimits::new(8, Duration::from_secs(1));
        let err = CoreError::from_sandbox(
            "f",
            SandboxError::MemoryLimit {
                used_bytes: 1,
                limit_bytes: 1,
            },
            &limits,
        );
        assert_eq!(
            err,
            CoreError::MemoryLimit {
                target: "f".into(),
                limit_mb: 8
            }
        );
    }

    #[test]
    fn test_fallback_eligibility() {
        assert!(CoreError::execution("a", "x").is_fallback_eligible());
        assert!(CoreError::Timeout {
            target: "a".into(),
            limit_ms: 1
        }
        .is_fallback_eligible());
        assert!(!CoreError::validation("a", "x").is_fallback_eligible());
        assert!(!CoreError::ChainDepthExceeded {
            agent: "a".into(),
            depth: 4,
            max: 3
        }
        .is_fallback_eligible());
    }

    #[test]
    fn test_storage_error_is_execution_kind() {
        let err: CoreError = StorageError::AgentNotFound { name: "x".into() }.into();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.report().kind, ErrorKind::Execution);
    }
}
