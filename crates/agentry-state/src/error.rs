//! Error types for agentry-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No agent definition with this name
    #[error("agent not found: {name}")]
    AgentNotFound { name: String },

    /// No function with this name
    #[error("function not found: {name}")]
    FunctionNotFound { name: String },

    /// The function exists but not at this version
    #[error("function {name} has no version {version}")]
    VersionNotFound { name: String, version: String },

    /// A version string that is not a SHA-256 hex digest
    #[error("invalid function version: {version}")]
    InvalidVersion { version: String },

    /// A name that cannot be used as a storage key
    #[error("invalid record name: {name:?}")]
    InvalidName { name: String },

    /// Filesystem error
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::VersionNotFound {
            name: "double".to_string(),
            version: "abc123".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("double"));
        assert!(msg.contains("abc123"));

        let err = StorageError::AgentNotFound {
            name: "planner".to_string(),
        };
        assert!(err.to_string().contains("agent not found"));
    }
}
