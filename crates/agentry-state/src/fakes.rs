//! In-memory storage backends
//!
//! `MemoryDefinitionStore` and `MemoryFunctionRepository` satisfy the trait
//! contracts without touching disk. They back tests and single-process
//! deployments that load definitions at startup.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::schema::{AgentDefinition, FunctionRecord};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryDefinitionStore
// ---------------------------------------------------------------------------

/// In-memory definition store backed by a `BTreeMap<name, definition>`.
#[derive(Debug, Default)]
pub struct MemoryDefinitionStore {
    agents: Mutex<BTreeMap<String, AgentDefinition>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn put_agent(&self, definition: AgentDefinition) -> StorageResult<()> {
        self.agents
            .lock()
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> StorageResult<AgentDefinition> {
        self.agents
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::AgentNotFound {
                name: name.to_string(),
            })
    }

    async fn list_agents(&self) -> StorageResult<Vec<AgentDefinition>> {
        Ok(self.agents.lock().values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryFunctionRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FunctionHistory {
    /// Versions in insertion order; the last one is `latest`.
    order: Vec<FunctionVersion>,
    records: HashMap<FunctionVersion, FunctionRecord>,
}

/// In-memory function repository keyed by name, then version.
#[derive(Debug, Default)]
pub struct MemoryFunctionRepository {
    functions: Mutex<BTreeMap<String, FunctionHistory>>,
}

impl MemoryFunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionRepository for MemoryFunctionRepository {
    async fn insert_version(&self, record: FunctionRecord) -> StorageResult<bool> {
        let mut functions = self.functions.lock();
        let history = functions.entry(record.name.clone()).or_default();
        if history.records.contains_key(&record.version) {
            return Ok(false);
        }
        history.order.push(record.version.clone());
        history.records.insert(record.version.clone(), record);
        Ok(true)
    }

    async fn get_version(
        &self,
        name: &str,
        version: &FunctionVersion,
    ) -> StorageResult<FunctionRecord> {
        let functions = self.functions.lock();
        let history = functions
            .get(name)
            .ok_or_else(|| StorageError::FunctionNotFound {
                name: name.to_string(),
            })?;
        history
            .records
            .get(version)
            .cloned()
            .ok_or_else(|| StorageError::VersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    async fn latest(&self, name: &str) -> StorageResult<FunctionRecord> {
        let functions = self.functions.lock();
        functions
            .get(name)
            .and_then(|h| h.order.last().and_then(|v| h.records.get(v)))
            .cloned()
            .ok_or_else(|| StorageError::FunctionNotFound {
                name: name.to_string(),
            })
    }

    async fn versions(&self, name: &str) -> StorageResult<Vec<FunctionVersion>> {
        let functions = self.functions.lock();
        functions
            .get(name)
            .map(|h| h.order.clone())
            .ok_or_else(|| StorageError::FunctionNotFound {
                name: name.to_string(),
            })
    }

    async fn list_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.functions.lock().keys().cloned().collect())
    }
}
