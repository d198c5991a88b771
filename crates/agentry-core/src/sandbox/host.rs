//! Host-provided sandbox modules (`fs`, `net`).
//!
//! The sandbox recognises these modules but implements none of their
//! functions. A host that wants functions to reach files or the network
//! installs a [`HostModule`] for the capability; without one, every call
//! fails at runtime even when the capability is granted.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::capability::Capability;

/// Synchronous provider for one capability module. Runs on the sandbox thread.
pub trait HostModule: Send + Sync {
    fn capability(&self) -> Capability;

    /// Call `function` with already-evaluated arguments.
    fn call(&self, function: &str, args: &[Value]) -> Result<Value, String>;
}

/// Installed providers, keyed by capability.
#[derive(Clone, Default)]
pub struct HostModules {
    providers: HashMap<Capability, Arc<dyn HostModule>>,
}

impl HostModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, module: Arc<dyn HostModule>) {
        self.providers.insert(module.capability(), module);
    }

    pub fn with(mut self, module: Arc<dyn HostModule>) -> Self {
        self.install(module);
        self
    }

    pub fn get(&self, capability: Capability) -> Option<&Arc<dyn HostModule>> {
        self.providers.get(&capability)
    }
}

impl std::fmt::Debug for HostModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut installed: Vec<_> = self.providers.keys().map(|c| c.module()).collect();
        installed.sort_unstable();
        f.debug_struct("HostModules")
            .field("installed", &installed)
            .finish()
    }
}

/// Read-only `fs` provider confined to one directory.
///
/// Functions: `fs.read(path)` returns file text, `fs.exists(path)` returns a bool.
/// Paths are relative to the root; absolute paths and `..` are refused.
#[derive(Debug, Clone)]
pub struct ReadOnlyFs {
    root: PathBuf,
}

impl ReadOnlyFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, args: &[Value]) -> Result<PathBuf, String> {
        let raw = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| "expected a path string".to_string())?;
        let path = Path::new(raw);
        let confined = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            return Err(format!("path '{raw}' escapes the sandbox root"));
        }
        Ok(self.root.join(path))
    }
}

impl HostModule for ReadOnlyFs {
    fn capability(&self) -> Capability {
        Capability::Fs
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<Value, String> {
        match function {
            "read" => {
                let path = self.resolve(args)?;
                std::fs::read_to_string(&path)
                    .map(Value::String)
                    .map_err(|e| format!("read failed: {e}"))
            }
            "exists" => Ok(Value::Bool(self.resolve(args)?.exists())),
            other => Err(format!("fs.{other} is not provided")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_only_fs_reads_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "hello").unwrap();
        let fs = ReadOnlyFs::new(dir.path());

        assert_eq!(fs.call("read", &[json!("note.txt")]).unwrap(), json!("hello"));
        assert_eq!(fs.call("exists", &[json!("missing.txt")]).unwrap(), json!(false));
    }

    #[test]
    fn test_read_only_fs_refuses_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ReadOnlyFs::new(dir.path());
        assert!(fs.call("read", &[json!("../etc/passwd")]).is_err());
        assert!(fs.call("read", &[json!("/etc/passwd")]).is_err());
        assert!(fs.call("write", &[json!("x")]).is_err());
    }

    #[test]
    fn test_registry_keys_by_capability() {
        let modules = HostModules::new().with(Arc::new(ReadOnlyFs::new(".")));
        assert!(modules.get(Capability::Fs).is_some());
        assert!(modules.get(Capability::Net).is_none());
    }
}
