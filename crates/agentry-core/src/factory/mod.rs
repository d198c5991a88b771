//! Agent Factory: turns an [`AgentDefinition`] into a runnable [`AgentInstance`].
//!
//! Every agent exposes the same operation, [`AgentInstance::process`]. What
//! happens inside is decided by a [`Strategy`] picked from the definition's
//! `kind`: a model-driven turn loop or a declarative plan. Strategies issue
//! calls through an [`Invocation`], which enforces `allowed_tools`, keeps
//! leaf calls at the current depth, and routes delegation back through the
//! registry one level deeper.

mod model;
mod plan;
mod tools;

use std::collections::HashMap;
use std::sync::Arc;

use agentry_state::{AgentDefinition, AgentKind, CallTarget, ChainStrategy};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::context::ChainContext;
use crate::error::{CoreError, CoreResult};
use crate::function_store::{FunctionStore, VersionRef};
use crate::schema::{check_schema, validate_for, SchemaStage};

pub use model::{ModelClient, ModelReply, ModelRequest, Observation, ScriptedModelClient};
pub use tools::{FnTool, ResolvedTool, ToolDescriptor, ToolHandler, Toolbox};

use model::ModelAgent;
use plan::PlanAgent;

/// One call issued by an agent: a tool/function or a sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub target: CallTarget,
    #[serde(default)]
    pub input: Value,
}

impl CallRequest {
    pub fn tool(name: impl Into<String>, input: Value) -> Self {
        Self {
            target: CallTarget::Tool(name.into()),
            input,
        }
    }

    pub fn agent(name: impl Into<String>, input: Value) -> Self {
        Self {
            target: CallTarget::Agent(name.into()),
            input,
        }
    }
}

/// Re-entry point for sub-agent calls. Implemented by the registry.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Run `agent` at `ctx.depth`, nested under `ctx.parent_execution_id`.
    async fn delegate(&self, agent: &str, input: Value, ctx: ChainContext) -> CoreResult<Value>;
}

/// Agent behaviour. One implementation per [`AgentKind`].
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn run(&self, invocation: &Invocation<'_>, input: Value) -> CoreResult<Value>;
}

/// Everything a strategy may use while handling one `process` call.
pub struct Invocation<'a> {
    definition: &'a AgentDefinition,
    context: &'a ChainContext,
    toolbox: &'a Toolbox,
    functions: &'a FunctionStore,
    delegate: &'a dyn Delegate,
    max_parallel: usize,
}

impl<'a> Invocation<'a> {
    pub fn definition(&self) -> &AgentDefinition {
        self.definition
    }

    /// The agent's own position: `parent_execution_id` is the agent's record.
    pub fn context(&self) -> &ChainContext {
        self.context
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.toolbox.names()
    }

    pub async fn call(&self, request: CallRequest) -> CoreResult<Value> {
        match request.target {
            CallTarget::Tool(name) => {
                self.toolbox
                    .call(
                        &self.definition.name,
                        &name,
                        request.input,
                        self.context,
                        self.functions,
                    )
                    .await
            }
            CallTarget::Agent(name) => {
                self.delegate
                    .delegate(&name, request.input, self.context.descend())
                    .await
            }
        }
    }

    /// Run one step's calls under the agent's chain strategy.
    ///
    /// Sequential stops at the first failure. Parallel lets every call
    /// finish, then reports the first failure in call order.
    pub async fn call_all(&self, calls: Vec<CallRequest>) -> CoreResult<Vec<Value>> {
        match self.definition.chain_strategy {
            ChainStrategy::Sequential => {
                let mut outputs = Vec::with_capacity(calls.len());
                for call in calls {
                    outputs.push(self.call(call).await?);
                }
                Ok(outputs)
            }
            ChainStrategy::Parallel => {
                let results: Vec<CoreResult<Value>> = stream::iter(calls.into_iter().map(|call| self.call(call)))
                    .buffered(self.max_parallel.max(1))
                    .collect()
                    .await;
                results.into_iter().collect()
            }
        }
    }
}

/// A live agent: its definition plus resolved tools and behaviour.
pub struct AgentInstance {
    definition: Arc<AgentDefinition>,
    strategy: Box<dyn Strategy>,
    toolbox: Toolbox,
    functions: Arc<FunctionStore>,
    max_parallel: usize,
}

impl AgentInstance {
    pub fn definition(&self) -> &Arc<AgentDefinition> {
        &self.definition
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    /// Validate `input`, run the agent's logic, validate its output.
    ///
    /// `ctx.parent_execution_id` must be this agent's own record so that its
    /// calls nest beneath it.
    pub async fn process(
        &self,
        input: Value,
        ctx: &ChainContext,
        delegate: &dyn Delegate,
    ) -> CoreResult<Value> {
        let name = &self.definition.name;
        validate_for(name, SchemaStage::Input, &self.definition.input_schema, &input)?;

        let invocation = Invocation {
            definition: &self.definition,
            context: ctx,
            toolbox: &self.toolbox,
            functions: &self.functions,
            delegate,
            max_parallel: self.max_parallel,
        };
        let output = self.strategy.run(&invocation, input).await?;

        validate_for(name, SchemaStage::Output, &self.definition.output_schema, &output)?;
        Ok(output)
    }
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance")
            .field("agent", &self.definition.name)
            .field("tools", &self.toolbox.names())
            .finish_non_exhaustive()
    }
}

/// Builds agent instances. Owns the host tool registry.
pub struct AgentFactory {
    functions: Arc<FunctionStore>,
    tools: RwLock<HashMap<String, Arc<ToolDescriptor>>>,
    model: Option<Arc<dyn ModelClient>>,
    max_parallel_calls: usize,
    max_model_turns: u32,
}

impl AgentFactory {
    pub fn new(functions: Arc<FunctionStore>, config: &EngineConfig) -> Self {
        Self {
            functions,
            tools: RwLock::new(HashMap::new()),
            model: None,
            max_parallel_calls: config.max_parallel_calls,
            max_model_turns: config.max_model_turns,
        }
    }

    pub fn with_model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.model = Some(client);
        self
    }

    pub fn functions(&self) -> &Arc<FunctionStore> {
        &self.functions
    }

    /// Add or replace a host tool. Instances built earlier keep their handles.
    pub fn register_tool(&self, tool: ToolDescriptor) -> CoreResult<()> {
        if tool.name.trim().is_empty() || tool.name.contains('@') {
            return Err(CoreError::validation(
                &tool.name,
                "tool names must be non-empty and must not contain '@'",
            ));
        }
        for (stage, schema) in [
            (SchemaStage::Input, &tool.input_schema),
            (SchemaStage::Output, &tool.output_schema),
        ] {
            check_schema(schema)
                .map_err(|e| CoreError::validation(&tool.name, format!("{stage} schema {e}")))?;
        }
        self.tools.write().insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build an instance, or fail without building anything.
    pub async fn create_agent(&self, definition: Arc<AgentDefinition>) -> CoreResult<AgentInstance> {
        let name = definition.name.as_str();
        let toolbox = self.resolve_tools(&definition).await?;

        let strategy: Box<dyn Strategy> = match &definition.kind {
            AgentKind::Model => {
                let client = self.model.clone().ok_or_else(|| {
                    CoreError::execution(name, "model-driven agent but no model client is configured")
                })?;
                Box::new(ModelAgent::new(client, self.max_model_turns))
            }
            AgentKind::Plan { steps, output } => {
                Box::new(PlanAgent::new(&definition, steps.clone(), *output, &toolbox)?)
            }
        };

        tracing::debug!(agent = %name, tools = toolbox.names().len(), "agent instance created");
        Ok(AgentInstance {
            definition,
            strategy,
            toolbox,
            functions: self.functions.clone(),
            max_parallel: self.max_parallel_calls,
        })
    }

    /// Host tools win over stored functions for unpinned names.
    async fn resolve_tools(&self, definition: &AgentDefinition) -> CoreResult<Toolbox> {
        let agent = definition.name.as_str();
        let mut toolbox = Toolbox::default();
        for reference in &definition.allowed_tools {
            let (tool_name, version) = VersionRef::parse_reference(reference)?;
            if toolbox.contains(&tool_name) {
                return Err(CoreError::validation(
                    agent,
                    format!("tool '{tool_name}' is listed more than once in allowed_tools"),
                ));
            }

            let host = match version {
                VersionRef::Latest => self.tools.read().get(&tool_name).cloned(),
                VersionRef::Exact(_) => None,
            };
            let resolved = match host {
                Some(tool) => ResolvedTool::Host(tool),
                None => {
                    self.functions.get(&tool_name, &version).await.map_err(|e| {
                        CoreError::execution(agent, format!("allowed tool '{reference}' is missing: {e}"))
                    })?;
                    ResolvedTool::Function {
                        name: tool_name.clone(),
                        version,
                    }
                }
            };
            toolbox.insert(tool_name, resolved);
        }
        Ok(toolbox)
    }
}

impl std::fmt::Debug for AgentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentFactory")
            .field("tools", &self.tool_names())
            .field("model", &self.model.is_some())
            .field("max_parallel_calls", &self.max_parallel_calls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_state::fakes::MemoryFunctionRepository;
    use agentry_state::{ErrorKind, ExecutionStatus, PlanOutput, PlanStep, InputBinding, ResourceLimits};
    use serde_json::json;

    use crate::function_store::StoreRequest;
    use crate::sandbox::Sandbox;
    use crate::tracker::ExecutionTracker;

    struct NoDelegation;

    #[async_trait]
    impl Delegate for NoDelegation {
        async fn delegate(&self, agent: &str, _input: Value, _ctx: ChainContext) -> CoreResult<Value> {
            Err(CoreError::execution(agent, "delegation disabled"))
        }
    }

    fn functions() -> Arc<FunctionStore> {
        Arc::new(FunctionStore::new(
            Arc::new(MemoryFunctionRepository::new()),
            ExecutionTracker::new(),
            Sandbox::default(),
            ResourceLimits::default(),
        ))
    }

    fn plan(name: &str, tool: &str) -> AgentDefinition {
        AgentDefinition::new(name, "").with_tool(tool).with_plan(
            vec![PlanStep {
                target: CallTarget::Tool(tool.to_string()),
                input: InputBinding::Forward,
            }],
            PlanOutput::Last,
        )
    }

    #[tokio::test]
    async fn test_missing_tool_fails_creation() {
        let factory = AgentFactory::new(functions(), &EngineConfig::default());
        let err = factory
            .create_agent(Arc::new(plan("a", "ghost")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_model_agent_needs_client() {
        let factory = AgentFactory::new(functions(), &EngineConfig::default());
        let err = factory
            .create_agent(Arc::new(AgentDefinition::new("m", "be helpful")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_host_tool_shadows_function_of_same_name() {
        let functions = functions();
        functions
            .store_function(StoreRequest::new("twice", "return x * 2;"))
            .await
            .unwrap();
        let factory = AgentFactory::new(functions.clone(), &EngineConfig::default());
        factory
            .register_tool(ToolDescriptor::new(
                "twice",
                Arc::new(FnTool(|_: Value| Ok::<Value, String>(json!("host")))),
            ))
            .unwrap();

        let agent = factory.create_agent(Arc::new(plan("a", "twice"))).await.unwrap();
        assert!(matches!(agent.toolbox().get("twice"), Some(ResolvedTool::Host(_))));

        let out = agent
            .process(json!({"x": 1}), &ChainContext::root("c1"), &NoDelegation)
            .await
            .unwrap();
        assert_eq!(out, json!("host"));
    }

    #[tokio::test]
    async fn test_pinned_function_reference() {
        let functions = functions();
        let v1 = functions
            .store_function(StoreRequest::new("inc", "return x + 1;"))
            .await
            .unwrap();
        functions
            .store_function(StoreRequest::new("inc", "return x + 100;"))
            .await
            .unwrap();

        let factory = AgentFactory::new(functions.clone(), &EngineConfig::default());
        let definition = AgentDefinition::new("a", "")
            .with_tool(format!("inc@{}", v1.version))
            .with_plan(
                vec![PlanStep {
                    target: CallTarget::Tool("inc".into()),
                    input: InputBinding::Forward,
                }],
                PlanOutput::Last,
            );
        let agent = factory.create_agent(Arc::new(definition)).await.unwrap();
        let out = agent
            .process(json!({"x": 1}), &ChainContext::root("c1"), &NoDelegation)
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn test_input_and_output_schemas_enforced() {
        let functions = functions();
        functions
            .store_function(StoreRequest::new("ident", "return input;"))
            .await
            .unwrap();
        let factory = AgentFactory::new(functions, &EngineConfig::default());
        let definition = plan("a", "ident").with_schemas(
            json!({"type": "object", "required": ["x"]}),
            json!({"type": "object", "required": ["result"]}),
        );
        let agent = factory.create_agent(Arc::new(definition)).await.unwrap();
        let ctx = ChainContext::root("c1");

        let err = agent.process(json!({}), &ctx, &NoDelegation).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("input"));

        let err = agent.process(json!({"x": 1}), &ctx, &NoDelegation).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("output"));
    }

    #[tokio::test]
    async fn test_call_outside_allowed_tools() {
        let functions = functions();
        functions
            .store_function(StoreRequest::new("secret", "return 1;"))
            .await
            .unwrap();
        let factory = AgentFactory::new(functions.clone(), &EngineConfig::default());
        let agent = factory
            .create_agent(Arc::new(
                AgentDefinition::new("a", "").with_plan(Vec::new(), PlanOutput::Collect),
            ))
            .await
            .unwrap();
        let ctx = ChainContext::root("c1");
        let invocation = Invocation {
            definition: agent.definition(),
            context: &ctx,
            toolbox: agent.toolbox(),
            functions: &functions,
            delegate: &NoDelegation,
            max_parallel: 2,
        };
        let err = invocation
            .call(CallRequest::tool("secret", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(functions.tracker().by_target("secret").is_empty());
    }

    #[tokio::test]
    async fn test_parallel_call_all_reports_first_failure_in_order() {
        let functions = functions();
        functions
            .store_function(StoreRequest::new("ok", "return 1;"))
            .await
            .unwrap();
        functions
            .store_function(StoreRequest::new("bad", "error(\"bad input\");"))
            .await
            .unwrap();
        let factory = AgentFactory::new(functions.clone(), &EngineConfig::default());
        let definition = AgentDefinition::new("p", "")
            .with_tool("ok")
            .with_tool("bad")
            .with_strategy(ChainStrategy::Parallel)
            .with_plan(Vec::new(), PlanOutput::Collect);
        let agent = factory.create_agent(Arc::new(definition)).await.unwrap();
        let ctx = ChainContext::root("c1");
        let invocation = Invocation {
            definition: agent.definition(),
            context: &ctx,
            toolbox: agent.toolbox(),
            functions: &functions,
            delegate: &NoDelegation,
            max_parallel: 2,
        };

        let err = invocation
            .call_all(vec![
                CallRequest::tool("ok", json!({})),
                CallRequest::tool("bad", json!({})),
                CallRequest::tool("ok", json!({})),
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad input"));

        // every sibling ran to a terminal state
        let records = functions.tracker().by_conversation("c1");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status.is_terminal()));
        assert_eq!(
            records
                .iter()
                .filter(|r| r.status == ExecutionStatus::Completed)
                .count(),
            2
        );
    }

    #[test]
    fn test_register_tool_rejects_bad_names() {
        let factory = AgentFactory::new(functions(), &EngineConfig::default());
        let handler: Arc<dyn ToolHandler> = Arc::new(FnTool(|v: Value| Ok::<Value, String>(v)));
        assert!(factory
            .register_tool(ToolDescriptor::new("a@b", handler.clone()))
            .is_err());
        assert!(factory
            .register_tool(ToolDescriptor::new("  ", handler.clone()))
            .is_err());
        factory
            .register_tool(ToolDescriptor::new("echo", handler))
            .unwrap();
        assert_eq!(factory.tool_names(), vec!["echo".to_string()]);
    }
}
