//! Host tools and the per-agent toolbox.
//!
//! A host tool is Rust code registered with the registry; it sits beside
//! stored functions in an agent's `allowed_tools`. Both are leaf calls:
//! they run at the caller's depth and never delegate further.

use std::collections::HashMap;
use std::sync::Arc;

use agentry_state::ExecutionKind;
use async_trait::async_trait;
use serde_json::Value;

use crate::context::ChainContext;
use crate::error::{CoreError, CoreResult};
use crate::function_store::{FunctionStore, VersionRef};
use crate::schema::{validate_for, SchemaStage};
use crate::tracker::{ExecutionTracker, NewExecution};

/// Host-side tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value) -> Result<Value, String>;
}

/// A host tool together with its contract.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Object(Default::default()),
            output_schema: Value::Object(Default::default()),
            handler,
        }
    }

    pub fn with_schemas(mut self, input: Value, output: Value) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Run the handler under its own execution record.
    pub(crate) async fn invoke(
        &self,
        tracker: &Arc<ExecutionTracker>,
        ctx: &ChainContext,
        input: Value,
    ) -> CoreResult<Value> {
        let scope = tracker.open(NewExecution::new(ExecutionKind::Tool, &self.name, ctx, input.clone()));
        if let Err(error) = validate_for(&self.name, SchemaStage::Input, &self.input_schema, &input) {
            scope.fail(&error);
            return Err(error);
        }

        scope.start();
        let result = self
            .handler
            .call(input)
            .await
            .map_err(|message| CoreError::execution(&self.name, message))
            .and_then(|output| {
                validate_for(&self.name, SchemaStage::Output, &self.output_schema, &output)?;
                Ok(output)
            });

        match result {
            Ok(output) => {
                scope.complete(output.clone());
                Ok(output)
            }
            Err(error) => {
                scope.fail(&error);
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Adapter so plain closures can be registered as tools.
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    async fn call(&self, input: Value) -> Result<Value, String> {
        (self.0)(input)
    }
}

/// One entry of an agent's `allowed_tools`, resolved at creation time.
#[derive(Debug, Clone)]
pub enum ResolvedTool {
    Host(Arc<ToolDescriptor>),
    Function { name: String, version: VersionRef },
}

/// Everything an agent instance may call, keyed by the name it calls it by.
#[derive(Debug, Clone, Default)]
pub struct Toolbox {
    tools: HashMap<String, ResolvedTool>,
}

impl Toolbox {
    pub(crate) fn insert(&mut self, name: String, tool: ResolvedTool) {
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Callable names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the tool `name` on behalf of `agent`.
    pub(crate) async fn call(
        &self,
        agent: &str,
        name: &str,
        input: Value,
        ctx: &ChainContext,
        functions: &FunctionStore,
    ) -> CoreResult<Value> {
        match self.tools.get(name) {
            Some(ResolvedTool::Host(tool)) => tool.invoke(functions.tracker(), ctx, input).await,
            Some(ResolvedTool::Function { name, version }) => {
                functions.execute_within(ctx, name, version, input).await
            }
            None => Err(CoreError::execution(
                agent,
                format!("tool '{name}' is not in allowed_tools"),
            )),
        }
    }
}
