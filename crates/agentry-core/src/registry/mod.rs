//! Agent Registry: the orchestration entry point.
//!
//! The registry owns the name -> definition map and the LRU of live
//! instances. Every agent invocation, top-level or delegated, passes through
//! [`Registry::process_at`]'s node logic, which enforces the chain-depth
//! bound, opens the node's execution record, and applies the fallback policy.

mod cache;

use std::collections::HashMap;
use std::sync::Arc;

use agentry_state::fakes::MemoryFunctionRepository;
use agentry_state::{
    AgentDefinition, DefinitionStore, ErrorKind, ErrorReport, ExecutionId, ExecutionKind,
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, Instrument};

use crate::config::EngineConfig;
use crate::context::ChainContext;
use crate::error::{CoreError, CoreResult};
use crate::factory::{AgentFactory, AgentInstance, Delegate, ModelClient, ToolDescriptor};
use crate::function_store::FunctionStore;
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{HostModules, Sandbox};
use crate::schema::check_schema;
use crate::tracker::{ExecutionTracker, NewExecution};

use cache::LruCache;

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<ErrorReport>,
    /// Record of the node that produced this outcome. `None` when the call
    /// was rejected before a record was opened.
    pub execution_id: Option<ExecutionId>,
}

impl ProcessOutcome {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// One resolved agent node.
struct Node {
    execution_id: Option<ExecutionId>,
    result: CoreResult<Value>,
}

impl From<Node> for ProcessOutcome {
    fn from(node: Node) -> Self {
        match node.result {
            Ok(value) => ProcessOutcome {
                success: true,
                result: Some(value),
                error: None,
                execution_id: node.execution_id,
            },
            Err(error) => ProcessOutcome {
                success: false,
                result: None,
                error: Some(error.report()),
                execution_id: node.execution_id,
            },
        }
    }
}

pub struct Registry {
    definitions: RwLock<HashMap<String, Arc<AgentDefinition>>>,
    cache: Mutex<LruCache>,
    factory: AgentFactory,
    store: Option<Arc<dyn DefinitionStore>>,
}

impl Registry {
    pub fn new(factory: AgentFactory, config: &EngineConfig) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(config.cache_capacity)),
            factory,
            store: None,
        }
    }

    /// Registry over in-memory function storage and a fresh tracker.
    pub fn in_memory(config: &EngineConfig) -> Self {
        let functions = FunctionStore::new(
            Arc::new(MemoryFunctionRepository::new()),
            ExecutionTracker::new(),
            Sandbox::new(HostModules::default(), config.timeout_grace()),
            config.default_limits,
        );
        Self::new(AgentFactory::new(Arc::new(functions), config), config)
    }

    /// Persist registrations to `store` as well.
    pub fn with_definition_store(mut self, store: Arc<dyn DefinitionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_model_client(self, client: Arc<dyn ModelClient>) -> Self {
        Self {
            factory: self.factory.with_model_client(client),
            ..self
        }
    }

    pub fn functions(&self) -> &Arc<FunctionStore> {
        self.factory.functions()
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        self.functions().tracker()
    }

    /// Insert or replace a definition. Cached instances built from the old
    /// definition are dropped, never mutated.
    pub async fn register_agent(&self, definition: AgentDefinition) -> CoreResult<()> {
        Self::check_definition(&definition)?;
        if let Some(store) = &self.store {
            store.put_agent(definition.clone()).await?;
        }
        self.install(definition);
        Ok(())
    }

    /// Add or replace a host tool. Invalidates every cached agent.
    pub fn register_tool(&self, tool: ToolDescriptor) -> CoreResult<()> {
        let name = tool.name.clone();
        self.factory.register_tool(tool)?;
        let dropped = self.cache.lock().clear();
        debug!(tool = %name, dropped, "tool registered; agent cache cleared");
        Ok(())
    }

    /// Register every active definition in `store`. Returns how many.
    pub async fn load_definitions(&self, store: &dyn DefinitionStore) -> CoreResult<usize> {
        let mut loaded = 0;
        for definition in store.list_agents().await? {
            if !definition.is_active {
                continue;
            }
            Self::check_definition(&definition)?;
            self.install(definition);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Registered definitions, sorted by name.
    pub fn list_agents(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<AgentDefinition> = self
            .definitions
            .read()
            .values()
            .map(|d| d.as_ref().clone())
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    /// Stop `name` from resolving. The definition is kept, marked inactive.
    pub async fn deactivate_agent(&self, name: &str) -> CoreResult<()> {
        let current = self
            .get_agent(name)
            .ok_or_else(|| CoreError::execution(name, "unknown agent"))?;
        let mut definition = current.as_ref().clone();
        definition.is_active = false;
        self.register_agent(definition).await
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.lock().contains(name)
    }

    pub fn cached_agents(&self) -> usize {
        self.cache.lock().len()
    }

    /// Run `agent` as the root of `conversation_id`.
    pub async fn process(&self, agent: &str, input: Value, conversation_id: &str) -> ProcessOutcome {
        self.process_at(agent, input, ChainContext::root(conversation_id))
            .instrument(obs::conversation_span(conversation_id))
            .await
    }

    /// Run `agent` at an explicit position in a chain.
    #[instrument(
        skip(self, input, ctx),
        fields(conversation_id = %ctx.conversation_id, depth = ctx.depth)
    )]
    pub async fn process_at(&self, agent: &str, input: Value, ctx: ChainContext) -> ProcessOutcome {
        self.run_node(agent, input, ctx, None).await.into()
    }

    fn check_definition(definition: &AgentDefinition) -> CoreResult<()> {
        if definition.name.trim().is_empty() {
            return Err(CoreError::validation(&definition.name, "agent name must not be empty"));
        }
        for (label, schema) in [
            ("input", &definition.input_schema),
            ("output", &definition.output_schema),
        ] {
            check_schema(schema).map_err(|e| {
                CoreError::validation(&definition.name, format!("{label} schema {e}"))
            })?;
        }
        Ok(())
    }

    fn install(&self, definition: AgentDefinition) {
        let name = definition.name.clone();
        let invalidated = {
            let mut definitions = self.definitions.write();
            let mut cache = self.cache.lock();
            definitions.insert(name.clone(), Arc::new(definition));
            cache.invalidate(&name)
        };
        obs::emit_agent_registered(&name, invalidated);
    }

    fn resolve(&self, name: &str) -> CoreResult<Arc<AgentDefinition>> {
        match self.definitions.read().get(name) {
            Some(definition) if definition.is_active => Ok(definition.clone()),
            Some(_) => Err(CoreError::execution(name, "agent is inactive")),
            None => Err(CoreError::execution(name, "unknown agent")),
        }
    }

    async fn instance(&self, definition: &Arc<AgentDefinition>) -> CoreResult<Arc<AgentInstance>> {
        let (cached, generation) = {
            let mut cache = self.cache.lock();
            (cache.get(definition), cache.generation())
        };
        if let Some(instance) = cached {
            METRICS.inc_cache_hits();
            return Ok(instance);
        }
        METRICS.inc_cache_misses();

        let instance = Arc::new(self.factory.create_agent(definition.clone()).await?);

        // Only cache if neither the definition nor the tool set was replaced
        // while building.
        let definitions = self.definitions.read();
        let current = definitions
            .get(&definition.name)
            .is_some_and(|d| Arc::ptr_eq(d, definition));
        let mut cache = self.cache.lock();
        if !current || cache.generation() != generation {
            debug!(agent = %definition.name, "agent superseded while building; not cached");
            return Ok(instance);
        }
        if let Some(evicted) = cache.insert(instance.clone()) {
            debug!(agent = %definition.name, evicted = %evicted, "agent cache evicted entry");
        }
        Ok(instance)
    }

    /// Resolve, record, run, and on failure maybe hand off to the fallback.
    ///
    /// `replacing` is set when this node is itself a fallback attempt; such
    /// nodes never fall back again.
    fn run_node<'a>(
        &'a self,
        name: &'a str,
        input: Value,
        ctx: ChainContext,
        replacing: Option<ExecutionId>,
    ) -> BoxFuture<'a, Node> {
        async move {
            METRICS.inc_agent_invocations();
            let new_record = |input: Value| {
                NewExecution::new(ExecutionKind::Agent, name, &ctx, input).replacing(replacing.clone())
            };

            let definition = match self.resolve(name) {
                Ok(definition) => definition,
                Err(error) => {
                    let scope = self.tracker().open(new_record(input));
                    let execution_id = Some(scope.id().clone());
                    scope.fail(&error);
                    return Node {
                        execution_id,
                        result: Err(error),
                    };
                }
            };

            if ctx.depth > definition.max_chain_depth {
                METRICS.inc_depth_rejections();
                obs::emit_depth_rejected(name, ctx.depth, definition.max_chain_depth);
                return Node {
                    execution_id: None,
                    result: Err(CoreError::ChainDepthExceeded {
                        agent: name.to_string(),
                        depth: ctx.depth,
                        max: definition.max_chain_depth,
                    }),
                };
            }

            let scope = self.tracker().open(new_record(input.clone()));
            let id = scope.id().clone();
            let result = match self.instance(&definition).await {
                Ok(instance) => {
                    scope.start();
                    instance.process(input.clone(), &ctx.within(&id), self).await
                }
                Err(error) => Err(error),
            };

            let error = match result {
                Ok(output) => {
                    scope.complete(output.clone());
                    return Node {
                        execution_id: Some(id),
                        result: Ok(output),
                    };
                }
                Err(error) => {
                    scope.fail(&error);
                    error
                }
            };

            let fallback = match &definition.fallback_agent_name {
                Some(fallback) if replacing.is_none() && error.is_fallback_eligible() => fallback,
                _ => {
                    return Node {
                        execution_id: Some(id),
                        result: Err(error),
                    }
                }
            };

            METRICS.inc_fallbacks();
            obs::emit_fallback(&id, name, fallback);
            self.run_node(fallback, input, ctx.clone(), Some(id)).await
        }
        .boxed()
    }
}

#[async_trait]
impl Delegate for Registry {
    async fn delegate(&self, agent: &str, input: Value, ctx: ChainContext) -> CoreResult<Value> {
        self.run_node(agent, input, ctx, None).await.result
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("agents", &self.definitions.read().len())
            .field("cached", &self.cache.lock().len())
            .field("factory", &self.factory)
            .finish()
    }
}
