//! Trait contract tests for DefinitionStore and FunctionRepository.
//!
//! Every conforming backend must pass these; they run against the in-memory
//! fakes and the JSON-file store.

use std::collections::BTreeSet;

use agentry_state::fakes::{MemoryDefinitionStore, MemoryFunctionRepository};
use agentry_state::storage_traits::*;
use agentry_state::{AgentDefinition, FunctionRecord, JsonFileStore, ResourceLimits, StorageError};
use chrono::Utc;

fn record(name: &str, code: &str) -> FunctionRecord {
    FunctionRecord {
        name: name.to_string(),
        description: String::new(),
        code: code.to_string(),
        version: FunctionVersion::from_code(code),
        input_schema: serde_json::json!({"type": "object"}),
        output_schema: serde_json::json!({}),
        resource_limits: ResourceLimits::default(),
        allowed_capabilities: BTreeSet::new(),
        is_async: false,
        created_at: Utc::now(),
    }
}

async fn check_definition_contract(store: &dyn DefinitionStore) {
    let err = store.get_agent("missing").await.unwrap_err();
    assert!(matches!(err, StorageError::AgentNotFound { .. }));

    store
        .put_agent(AgentDefinition::new("writer", "v1"))
        .await
        .unwrap();
    store
        .put_agent(AgentDefinition::new("reader", "r"))
        .await
        .unwrap();
    store
        .put_agent(AgentDefinition::new("writer", "v2"))
        .await
        .unwrap();

    let writer = store.get_agent("writer").await.unwrap();
    assert_eq!(writer.system_prompt, "v2");

    let names: Vec<String> = store
        .list_agents()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["reader".to_string(), "writer".to_string()]);
}

async fn check_function_contract(repo: &dyn FunctionRepository) {
    let v1 = record("double", "return x * 2;");
    let v2 = record("double", "return { result: x * 2 };");

    assert!(repo.insert_version(v1.clone()).await.unwrap());
    assert!(repo.insert_version(v2.clone()).await.unwrap());

    // Same content again: no-op, latest untouched.
    assert!(!repo.insert_version(v1.clone()).await.unwrap());
    assert_eq!(repo.latest("double").await.unwrap().version, v2.version);

    let old = repo.get_version("double", &v1.version).await.unwrap();
    assert_eq!(old.code, v1.code);

    assert_eq!(
        repo.versions("double").await.unwrap(),
        vec![v1.version.clone(), v2.version.clone()]
    );
    assert_eq!(repo.list_names().await.unwrap(), vec!["double".to_string()]);

    let missing = FunctionVersion::from_code("never stored");
    let err = repo.get_version("double", &missing).await.unwrap_err();
    assert!(matches!(err, StorageError::VersionNotFound { .. }));

    let err = repo.latest("nope").await.unwrap_err();
    assert!(matches!(err, StorageError::FunctionNotFound { .. }));
}

#[tokio::test]
async fn memory_definition_store_contract() {
    check_definition_contract(&MemoryDefinitionStore::new()).await;
}

#[tokio::test]
async fn memory_function_repository_contract() {
    check_function_contract(&MemoryFunctionRepository::new()).await;
}

#[tokio::test]
async fn json_store_definition_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path()).unwrap();
    check_definition_contract(&store).await;
}

#[tokio::test]
async fn json_store_function_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path()).unwrap();
    check_function_contract(&store).await;
}

#[tokio::test]
async fn json_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let v = record("triple", "return x * 3;");
    {
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.insert_version(v.clone()).await.unwrap();
        store
            .put_agent(AgentDefinition::new("planner", "plan things"))
            .await
            .unwrap();
    }

    let reopened = JsonFileStore::open(dir.path()).unwrap();
    assert_eq!(reopened.latest("triple").await.unwrap(), v);
    assert_eq!(
        reopened.get_agent("planner").await.unwrap().system_prompt,
        "plan things"
    );
}

#[tokio::test]
async fn json_store_rejects_unsafe_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path()).unwrap();
    let err = store.get_agent("../escape").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidName { .. }));
}
