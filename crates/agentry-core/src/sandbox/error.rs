//! Error types for the sandbox module.

/// Errors produced by compiling or running sandboxed code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("capability violation on line {line}: {reason}")]
    Violation { line: usize, reason: String },

    #[error("memory limit exceeded: {used_bytes} bytes needed, limit {limit_bytes} bytes")]
    MemoryLimit { used_bytes: usize, limit_bytes: usize },

    #[error("execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("runtime error on line {line}: {message}")]
    Runtime { line: usize, message: String },
}

impl SandboxError {
    pub(crate) fn runtime(line: usize, message: impl Into<String>) -> Self {
        SandboxError::Runtime {
            line,
            message: message.into(),
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
