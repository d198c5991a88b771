//! Storage trait definitions for Agentry
//!
//! These traits define the persistence collaborators of the execution core:
//! - `DefinitionStore`: agent definitions keyed by name
//! - `FunctionRepository`: content-versioned function bodies
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module; `JsonFileStore` persists to a directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::schema::{AgentDefinition, FunctionRecord};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// FunctionVersion: content-derived version identifier
// ---------------------------------------------------------------------------

/// Function version (SHA-256 hex of the function body).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_code` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionVersion(String);

impl FunctionVersion {
    /// Compute the version of a function body.
    pub fn from_code(code: &str) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        FunctionVersion(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for FunctionVersion {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidVersion { version: s });
        }
        Ok(FunctionVersion(s.to_ascii_lowercase()))
    }
}

impl From<FunctionVersion> for String {
    fn from(v: FunctionVersion) -> Self {
        v.0
    }
}

impl std::fmt::Display for FunctionVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DefinitionStore
// ---------------------------------------------------------------------------

/// Agent definition storage.
///
/// Guarantees:
/// - `put_agent` replaces any previous definition with the same name.
/// - `get_agent` returns `StorageError::AgentNotFound` for unknown names.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert or replace a definition.
    async fn put_agent(&self, definition: AgentDefinition) -> StorageResult<()>;

    /// Fetch a definition by name.
    async fn get_agent(&self, name: &str) -> StorageResult<AgentDefinition>;

    /// All stored definitions, ordered by name.
    async fn list_agents(&self) -> StorageResult<Vec<AgentDefinition>>;
}

// ---------------------------------------------------------------------------
// FunctionRepository
// ---------------------------------------------------------------------------

/// Content-versioned function storage.
///
/// Guarantees:
/// - A `(name, version)` pair is written at most once; the stored record is
///   never replaced.
/// - Inserting a new version makes it the latest for that name.
/// - Re-inserting an existing version is a no-op and leaves `latest` alone.
#[async_trait]
pub trait FunctionRepository: Send + Sync {
    /// Insert a version. Returns `false` if `(name, version)` already existed.
    async fn insert_version(&self, record: FunctionRecord) -> StorageResult<bool>;

    /// Fetch an exact version.
    async fn get_version(
        &self,
        name: &str,
        version: &FunctionVersion,
    ) -> StorageResult<FunctionRecord>;

    /// Fetch the most recently inserted version.
    async fn latest(&self, name: &str) -> StorageResult<FunctionRecord>;

    /// All versions of a function, oldest first.
    async fn versions(&self, name: &str) -> StorageResult<Vec<FunctionVersion>>;

    /// All function names, sorted.
    async fn list_names(&self) -> StorageResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_deterministic() {
        let a = FunctionVersion::from_code("return x * 2;");
        let b = FunctionVersion::from_code("return x * 2;");
        let c = FunctionVersion::from_code("return x * 3;");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_version_try_from_rejects_non_hex() {
        assert!(FunctionVersion::try_from("latest".to_string()).is_err());
        let upper = "A".repeat(64);
        let v = FunctionVersion::try_from(upper).unwrap();
        assert_eq!(v.as_str(), "a".repeat(64));
    }

    #[test]
    fn test_version_serde_validates() {
        let bad: Result<FunctionVersion, _> = serde_json::from_str(r#""nope""#);
        assert!(bad.is_err());
        let v = FunctionVersion::from_code("x");
        let json = serde_json::to_string(&v).unwrap();
        let back: FunctionVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
