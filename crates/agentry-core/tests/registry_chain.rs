//! Registry scenarios: chain depth, fallback, parallel siblings, caching,
//! and model-driven agents.

use std::sync::Arc;
use std::time::Duration;

use agentry_core::{
    AgentDefinition, AgentFactory, CallRequest, CallTarget, ChainStrategy, EngineConfig,
    ErrorKind, ExecutionKind, ExecutionStatus, ExecutionTracker, FnTool, FunctionRecord,
    FunctionStore, FunctionVersion, InputBinding, ModelReply, PlanOutput, PlanStep, Registry,
    Sandbox, ScriptedModelClient, StoreRequest, ToolDescriptor,
};
use agentry_state::fakes::MemoryFunctionRepository;
use agentry_state::{FunctionRepository, StorageResult};
use async_trait::async_trait;
use serde_json::{json, Value};

fn step(target: CallTarget, input: InputBinding) -> PlanStep {
    PlanStep { target, input }
}

fn tool(name: &str) -> CallTarget {
    CallTarget::Tool(name.to_string())
}

fn agent(name: &str) -> CallTarget {
    CallTarget::Agent(name.to_string())
}

async fn registry_with(config: EngineConfig) -> Registry {
    let registry = Registry::in_memory(&config);
    registry
        .register_tool(ToolDescriptor::new(
            "echo",
            Arc::new(FnTool(|v: Value| Ok::<Value, String>(v))),
        ))
        .unwrap();
    registry
        .functions()
        .store_function(StoreRequest::new("double", "return {result: x * 2};"))
        .await
        .unwrap();
    registry
        .functions()
        .store_function(StoreRequest::new("boom", "error(\"tool exploded\");"))
        .await
        .unwrap();
    registry
}

async fn registry() -> Registry {
    registry_with(EngineConfig::default()).await
}

fn echo_agent(name: &str) -> AgentDefinition {
    AgentDefinition::new(name, "")
        .with_tool("echo")
        .with_plan(vec![step(tool("echo"), InputBinding::Forward)], PlanOutput::Last)
}

fn failing_agent(name: &str) -> AgentDefinition {
    AgentDefinition::new(name, "")
        .with_tool("boom")
        .with_plan(vec![step(tool("boom"), InputBinding::Forward)], PlanOutput::Last)
}

#[tokio::test]
async fn test_self_recursion_hits_depth_bound_without_fallback() {
    let registry = registry().await;
    registry.register_agent(echo_agent("B")).await.unwrap();
    registry
        .register_agent(
            AgentDefinition::new("A", "")
                .with_max_chain_depth(1)
                .with_fallback("B")
                .with_plan(vec![step(agent("A"), InputBinding::Forward)], PlanOutput::Last),
        )
        .await
        .unwrap();

    let outcome = registry.process("A", json!({}), "recursion").await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::ChainDepthExceeded));

    // depth 0 and depth 1 ran; depth 2 was refused before a record existed
    let records = registry.tracker().by_conversation("recursion");
    let mut depths: Vec<u32> = records.iter().map(|r| r.depth).collect();
    depths.sort();
    assert_eq!(depths, vec![0, 1]);
    assert!(records.iter().all(|r| r.target == "A"));
    assert!(records.iter().all(|r| r.status == ExecutionStatus::Failed));
    assert!(registry.tracker().by_target("B").is_empty());

    for record in &records {
        assert!(record.depth <= 1);
    }
}

#[tokio::test]
async fn test_failure_without_fallback_leaves_single_record() {
    let registry = registry().await;
    registry.register_agent(failing_agent("C")).await.unwrap();

    let outcome = registry.process("C", json!({}), "no-fallback").await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Execution));

    let agent_records = registry.tracker().by_target("C");
    assert_eq!(agent_records.len(), 1);
    assert_eq!(agent_records[0].status, ExecutionStatus::Failed);
    assert_eq!(outcome.execution_id.as_ref(), Some(&agent_records[0].id));

    let children = registry.tracker().children(&agent_records[0].id);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].kind, ExecutionKind::Function);
    assert_eq!(children[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_fallback_replaces_failed_node_at_same_depth() {
    let registry = registry().await;
    registry.register_agent(echo_agent("E")).await.unwrap();
    registry
        .register_agent(failing_agent("D").with_fallback("E"))
        .await
        .unwrap();

    let outcome = registry.process("D", json!({"q": 1}), "fallback").await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.result, Some(json!({"q": 1})));

    let failed = &registry.tracker().by_target("D")[0];
    let replacement = &registry.tracker().by_target("E")[0];
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(replacement.status, ExecutionStatus::Completed);
    assert_eq!(replacement.fallback_for.as_ref(), Some(&failed.id));
    assert_eq!(replacement.depth, failed.depth);
    assert_eq!(replacement.parent_execution_id, failed.parent_execution_id);
    assert_eq!(outcome.execution_id.as_ref(), Some(&replacement.id));
}

#[tokio::test]
async fn test_fallback_is_attempted_once() {
    let registry = registry().await;
    registry
        .register_agent(failing_agent("F2").with_fallback("F1"))
        .await
        .unwrap();
    registry
        .register_agent(failing_agent("F1").with_fallback("F2"))
        .await
        .unwrap();

    let outcome = registry.process("F1", json!({}), "ping-pong").await;
    assert!(!outcome.success);
    assert_eq!(registry.tracker().by_target("F1").len(), 1);
    assert_eq!(registry.tracker().by_target("F2").len(), 1);
}

#[tokio::test]
async fn test_validation_failure_does_not_fall_back() {
    let registry = registry().await;
    registry.register_agent(echo_agent("E")).await.unwrap();
    registry
        .register_agent(
            echo_agent("strict")
                .with_schemas(json!({"type": "object", "required": ["x"]}), json!({}))
                .with_fallback("E"),
        )
        .await
        .unwrap();

    let outcome = registry.process("strict", json!({}), "strict").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
    assert!(registry.tracker().by_target("E").is_empty());
}

#[tokio::test]
async fn test_delegation_nests_one_level_deeper() {
    let registry = registry().await;
    registry.register_agent(echo_agent("leaf")).await.unwrap();
    registry
        .register_agent(
            AgentDefinition::new("root", "")
                .with_tool("double")
                .with_plan(
                    vec![
                        step(tool("double"), InputBinding::Forward),
                        step(agent("leaf"), InputBinding::Previous),
                    ],
                    PlanOutput::Last,
                ),
        )
        .await
        .unwrap();

    let outcome = registry.process("root", json!({"x": 21}), "nest").await;
    assert_eq!(outcome.result, Some(json!({"result": 42})));

    let tree = registry.tracker().tree("nest");
    assert_eq!(tree.len(), 1);
    let root = &tree[0];
    assert_eq!(root.record.target, "root");
    let kids: Vec<(&str, u32)> = root
        .children
        .iter()
        .map(|n| (n.record.target.as_str(), n.record.depth))
        .collect();
    assert_eq!(kids, vec![("double", 0), ("leaf", 1)]);
    assert_eq!(root.children[1].children[0].record.target, "echo");
}

#[tokio::test]
async fn test_parallel_calls_are_siblings() {
    let registry = registry().await;
    registry
        .register_agent(
            AgentDefinition::new("fan", "")
                .with_tool("double")
                .with_strategy(ChainStrategy::Parallel)
                .with_plan(
                    (1..=3)
                        .map(|x| step(tool("double"), InputBinding::Value(json!({"x": x}))))
                        .collect(),
                    PlanOutput::Collect,
                ),
        )
        .await
        .unwrap();

    let outcome = registry.process("fan", json!({}), "fan-out").await;
    assert_eq!(
        outcome.result,
        Some(json!([{"result": 2}, {"result": 4}, {"result": 6}]))
    );

    let parent = outcome.execution_id.unwrap();
    let children = registry.tracker().children(&parent);
    assert_eq!(children.len(), 3);
    assert!(children
        .iter()
        .all(|c| c.status == ExecutionStatus::Completed && c.depth == 0));
    let parent_record = registry.tracker().get(&parent).unwrap();
    assert!(children
        .iter()
        .all(|c| c.finished_at <= parent_record.finished_at));
}

#[tokio::test]
async fn test_parallel_failure_waits_for_all_siblings() {
    let registry = registry().await;
    registry
        .register_agent(
            AgentDefinition::new("mixed", "")
                .with_tool("double")
                .with_tool("boom")
                .with_strategy(ChainStrategy::Parallel)
                .with_plan(
                    vec![
                        step(tool("boom"), InputBinding::Forward),
                        step(tool("double"), InputBinding::Value(json!({"x": 1}))),
                    ],
                    PlanOutput::Collect,
                ),
        )
        .await
        .unwrap();

    let outcome = registry.process("mixed", json!({}), "mixed").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Execution));
    let children = registry.tracker().children(outcome.execution_id.as_ref().unwrap());
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.status.is_terminal()));
}

#[tokio::test]
async fn test_lru_evicts_least_recently_used_agent() {
    let registry = registry_with(EngineConfig {
        cache_capacity: 2,
        ..EngineConfig::default()
    })
    .await;
    for name in ["a", "b", "c"] {
        registry.register_agent(echo_agent(name)).await.unwrap();
    }

    registry.process("a", json!(1), "lru").await;
    registry.process("b", json!(1), "lru").await;
    registry.process("a", json!(1), "lru").await;
    registry.process("c", json!(1), "lru").await;

    assert!(registry.is_cached("a"));
    assert!(!registry.is_cached("b"));
    assert!(registry.is_cached("c"));
    assert_eq!(registry.cached_agents(), 2);
}

#[tokio::test]
async fn test_reregistered_definition_takes_effect() {
    let registry = registry().await;
    registry.register_agent(echo_agent("swap")).await.unwrap();
    assert!(registry.process("swap", json!(1), "swap").await.success);

    registry.register_agent(failing_agent("swap")).await.unwrap();
    let outcome = registry.process("swap", json!(1), "swap").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Execution));
}

/// Function repository whose `latest` lookups take a while.
struct SlowLatest {
    inner: MemoryFunctionRepository,
    delay: Duration,
}

#[async_trait]
impl FunctionRepository for SlowLatest {
    async fn insert_version(&self, record: FunctionRecord) -> StorageResult<bool> {
        self.inner.insert_version(record).await
    }

    async fn get_version(
        &self,
        name: &str,
        version: &FunctionVersion,
    ) -> StorageResult<FunctionRecord> {
        self.inner.get_version(name, version).await
    }

    async fn latest(&self, name: &str) -> StorageResult<FunctionRecord> {
        tokio::time::sleep(self.delay).await;
        self.inner.latest(name).await
    }

    async fn versions(&self, name: &str) -> StorageResult<Vec<FunctionVersion>> {
        self.inner.versions(name).await
    }

    async fn list_names(&self) -> StorageResult<Vec<String>> {
        self.inner.list_names().await
    }
}

#[tokio::test]
async fn test_tool_registered_mid_build_is_not_shadowed_by_stale_cache() {
    let config = EngineConfig::default();
    let functions = FunctionStore::new(
        Arc::new(SlowLatest {
            inner: MemoryFunctionRepository::new(),
            delay: Duration::from_millis(200),
        }),
        ExecutionTracker::new(),
        Sandbox::default(),
        config.default_limits,
    );
    let registry = Arc::new(Registry::new(
        AgentFactory::new(Arc::new(functions), &config),
        &config,
    ));
    registry
        .functions()
        .store_function(StoreRequest::new("t", "return \"function\";"))
        .await
        .unwrap();
    registry
        .register_agent(
            AgentDefinition::new("a", "")
                .with_tool("t")
                .with_plan(vec![step(tool("t"), InputBinding::Forward)], PlanOutput::Last),
        )
        .await
        .unwrap();

    let running = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.process("a", json!({}), "slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry
        .register_tool(ToolDescriptor::new(
            "t",
            Arc::new(FnTool(|_: Value| Ok::<Value, String>(json!("host")))),
        ))
        .unwrap();

    // the in-flight call finishes with the handles it resolved
    let first = running.await.unwrap();
    assert_eq!(first.result, Some(json!("function")));
    assert!(!registry.is_cached("a"));

    let second = registry.process("a", json!({}), "slow").await;
    assert_eq!(second.result, Some(json!("host")));
    assert!(registry.is_cached("a"));
}

#[tokio::test]
async fn test_concurrent_conversations_stay_separate() {
    let registry = registry().await;
    registry.register_agent(echo_agent("a")).await.unwrap();

    let (one, two) = tokio::join!(
        registry.process("a", json!(1), "one"),
        registry.process("a", json!(2), "two"),
    );
    assert_eq!(one.result, Some(json!(1)));
    assert_eq!(two.result, Some(json!(2)));
    assert_eq!(registry.tracker().by_conversation("one").len(), 2);
    assert_eq!(registry.tracker().by_conversation("two").len(), 2);
}

#[tokio::test]
async fn test_model_agent_turn_loop() {
    let client = Arc::new(
        ScriptedModelClient::new()
            .with_reply(
                "calc",
                ModelReply::Calls {
                    calls: vec![CallRequest::tool("double", json!({"x": 4}))],
                },
            )
            .with_reply(
                "calc",
                ModelReply::Final {
                    output: json!({"answer": 8}),
                },
            ),
    );
    let registry = registry().await.with_model_client(client.clone());
    registry
        .register_agent(AgentDefinition::new("calc", "You double numbers.").with_tool("double"))
        .await
        .unwrap();

    let outcome = registry.process("calc", json!({"n": 4}), "model").await;
    assert_eq!(outcome.result, Some(json!({"answer": 8})));

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].system_prompt, "You double numbers.");
    assert_eq!(requests[0].tools, vec!["double".to_string()]);
    assert_eq!(requests[1].observations.len(), 1);
    assert_eq!(requests[1].observations[0].output, json!({"result": 8}));
}

#[tokio::test]
async fn test_model_agent_turn_budget() {
    let client = Arc::new(ScriptedModelClient::new());
    for _ in 0..3 {
        client.push(
            "loop",
            ModelReply::Calls {
                calls: vec![CallRequest::tool("echo", json!(null))],
            },
        );
    }
    let registry = registry_with(EngineConfig {
        max_model_turns: 2,
        ..EngineConfig::default()
    })
    .await
    .with_model_client(client);
    registry
        .register_agent(AgentDefinition::new("loop", "").with_tool("echo"))
        .await
        .unwrap();

    let outcome = registry.process("loop", json!({}), "budget").await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Execution));
    assert!(outcome.error.unwrap().message.contains("2 model turns"));
}
