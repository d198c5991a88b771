//! Directory-backed storage using one JSON document per record.
//!
//! Layout:
//!
//! ```text
//! <root>/agents/<name>.json
//! <root>/functions/<name>/versions.json      ordered version list, last = latest
//! <root>/functions/<name>/<version>.json
//! ```
//!
//! Writes go through a temp file in the target directory followed by a
//! rename, so readers never observe a half-written record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::schema::{AgentDefinition, FunctionRecord};
use crate::storage_traits::*;

/// JSON-file implementation of [`DefinitionStore`] and [`FunctionRepository`].
pub struct JsonFileStore {
    agents_dir: PathBuf,
    functions_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let agents_dir = root.as_ref().join("agents");
        let functions_dir = root.as_ref().join("functions");
        fs::create_dir_all(&agents_dir)?;
        fs::create_dir_all(&functions_dir)?;
        Ok(Self {
            agents_dir,
            functions_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn agent_path(&self, name: &str) -> StorageResult<PathBuf> {
        check_name(name)?;
        Ok(self.agents_dir.join(format!("{name}.json")))
    }

    fn function_dir(&self, name: &str) -> StorageResult<PathBuf> {
        check_name(name)?;
        Ok(self.functions_dir.join(name))
    }

    fn read_versions(&self, dir: &Path) -> StorageResult<Vec<FunctionVersion>> {
        let index = dir.join("versions.json");
        if !index.exists() {
            return Ok(Vec::new());
        }
        read_json(&index)
    }
}

/// Names become path components; keep them to a conservative character set.
fn check_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName {
            name: name.to_string(),
        })
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let dir = path.parent().ok_or_else(|| StorageError::InvalidName {
        name: path.display().to_string(),
    })?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(value)?)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl DefinitionStore for JsonFileStore {
    async fn put_agent(&self, definition: AgentDefinition) -> StorageResult<()> {
        let path = self.agent_path(&definition.name)?;
        let _guard = self.write_lock.lock();
        write_json_atomic(&path, &definition)
    }

    async fn get_agent(&self, name: &str) -> StorageResult<AgentDefinition> {
        let path = self.agent_path(name)?;
        if !path.exists() {
            return Err(StorageError::AgentNotFound {
                name: name.to_string(),
            });
        }
        read_json(&path)
    }

    async fn list_agents(&self) -> StorageResult<Vec<AgentDefinition>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.agents_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths.iter().map(|p| read_json(p)).collect()
    }
}

#[async_trait]
impl FunctionRepository for JsonFileStore {
    async fn insert_version(&self, record: FunctionRecord) -> StorageResult<bool> {
        let dir = self.function_dir(&record.name)?;
        let _guard = self.write_lock.lock();

        let mut versions = self.read_versions(&dir)?;
        if versions.contains(&record.version) {
            return Ok(false);
        }

        write_json_atomic(&dir.join(format!("{}.json", record.version)), &record)?;
        versions.push(record.version.clone());
        write_json_atomic(&dir.join("versions.json"), &versions)?;
        tracing::debug!(function = %record.name, version = %record.version.short(), "function version persisted");
        Ok(true)
    }

    async fn get_version(
        &self,
        name: &str,
        version: &FunctionVersion,
    ) -> StorageResult<FunctionRecord> {
        let dir = self.function_dir(name)?;
        if !dir.exists() {
            return Err(StorageError::FunctionNotFound {
                name: name.to_string(),
            });
        }
        let path = dir.join(format!("{version}.json"));
        if !path.exists() {
            return Err(StorageError::VersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        read_json(&path)
    }

    async fn latest(&self, name: &str) -> StorageResult<FunctionRecord> {
        let dir = self.function_dir(name)?;
        let versions = self.read_versions(&dir)?;
        match versions.last() {
            Some(latest) => self.get_version(name, latest).await,
            None => Err(StorageError::FunctionNotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn versions(&self, name: &str) -> StorageResult<Vec<FunctionVersion>> {
        let dir = self.function_dir(name)?;
        let versions = self.read_versions(&dir)?;
        if versions.is_empty() {
            return Err(StorageError::FunctionNotFound {
                name: name.to_string(),
            });
        }
        Ok(versions)
    }

    async fn list_names(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.functions_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|e| e.path().join("versions.json").exists())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_name_rejects_path_tricks() {
        assert!(check_name("double").is_ok());
        assert!(check_name("summarize-v2.1").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("../etc").is_err());
        assert!(check_name(".hidden").is_err());
        assert!(check_name("a/b").is_err());
    }
}
