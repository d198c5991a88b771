//! Function Store: validated, content-versioned, sandboxed functions.
//!
//! `store_function` parses and analyzes code before anything is persisted;
//! a body that would reach beyond its capability allow-list is never stored.
//! `execute_function` validates input, runs the body in a fresh sandbox
//! context under the version's own limits, validates output, and always
//! leaves exactly one terminal execution record behind.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use agentry_state::{
    ExecutionKind, FunctionRecord, FunctionRepository, FunctionVersion, ResourceLimits,
    StorageError,
};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::Instrument;

use crate::context::ChainContext;
use crate::error::{CoreError, CoreResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{self, Capability, CompiledProgram, Sandbox, SandboxLimits};
use crate::schema::{check_schema, validate_for, SchemaStage};
use crate::tracker::{ExecutionTracker, NewExecution};

/// Which stored version of a function to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionRef {
    Latest,
    Exact(FunctionVersion),
}

impl VersionRef {
    /// Split `name@<version>` into its parts; a bare name means `Latest`.
    pub fn parse_reference(reference: &str) -> CoreResult<(String, VersionRef)> {
        match reference.split_once('@') {
            None => Ok((reference.to_string(), VersionRef::Latest)),
            Some((name, version)) => {
                let version = FunctionVersion::try_from(version.to_string())
                    .map_err(|e| CoreError::validation(name, e.to_string()))?;
                Ok((name.to_string(), VersionRef::Exact(version)))
            }
        }
    }
}

impl std::fmt::Display for VersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionRef::Latest => f.write_str("latest"),
            VersionRef::Exact(v) => write!(f, "{}", v.short()),
        }
    }
}

/// Input to [`FunctionStore::store_function`].
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub name: String,
    pub description: String,
    pub code: String,
    pub input_schema: Value,
    pub output_schema: Value,
    /// Engine defaults when `None`.
    pub limits: Option<ResourceLimits>,
    pub allowed_capabilities: BTreeSet<String>,
    pub is_async: bool,
}

impl StoreRequest {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            code: code.into(),
            input_schema: Value::Object(Default::default()),
            output_schema: Value::Object(Default::default()),
            limits: None,
            allowed_capabilities: BTreeSet::new(),
            is_async: false,
        }
    }

    pub fn with_schemas(mut self, input: Value, output: Value) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    pub fn with_limits(mut self, memory_limit_mb: u64, timeout_seconds: f64) -> Self {
        self.limits = Some(ResourceLimits {
            memory_limit_mb,
            timeout_seconds,
        });
        self
    }

    pub fn allow(mut self, capability: impl Into<String>) -> Self {
        self.allowed_capabilities.insert(capability.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A stored version plus its ready-to-run program.
#[derive(Debug)]
struct CompiledFunction {
    record: FunctionRecord,
    program: CompiledProgram,
    limits: SandboxLimits,
}

fn parse_capabilities(name: &str, allowed: &BTreeSet<String>) -> CoreResult<BTreeSet<Capability>> {
    allowed
        .iter()
        .map(|c| c.parse::<Capability>().map_err(|e| CoreError::validation(name, e)))
        .collect()
}

fn sandbox_limits(name: &str, limits: &ResourceLimits) -> CoreResult<SandboxLimits> {
    if limits.memory_limit_mb == 0 {
        return Err(CoreError::validation(name, "memory_limit_mb must be at least 1"));
    }
    let timeout = Duration::try_from_secs_f64(limits.timeout_seconds)
        .ok()
        .filter(|t| !t.is_zero())
        .ok_or_else(|| CoreError::validation(name, "timeout_seconds must be a positive number"))?;
    Ok(SandboxLimits::new(limits.memory_limit_mb, timeout))
}

fn compile_record(record: FunctionRecord) -> CoreResult<CompiledFunction> {
    let limits = sandbox_limits(&record.name, &record.resource_limits)?;
    let allowed = parse_capabilities(&record.name, &record.allowed_capabilities)?;
    let program = sandbox::compile(&record.code, &allowed)
        .map_err(|e| CoreError::from_sandbox(&record.name, e, &limits))?;
    Ok(CompiledFunction {
        record,
        program,
        limits,
    })
}

fn not_found(name: &str, error: StorageError) -> CoreError {
    match error {
        StorageError::FunctionNotFound { .. } | StorageError::VersionNotFound { .. } => {
            CoreError::execution(name, error.to_string())
        }
        other => other.into(),
    }
}

/// Stores and runs functions. Cheap to share behind an `Arc`.
pub struct FunctionStore {
    repo: Arc<dyn FunctionRepository>,
    tracker: Arc<ExecutionTracker>,
    sandbox: Sandbox,
    default_limits: ResourceLimits,
    compiled: RwLock<HashMap<(String, FunctionVersion), Arc<CompiledFunction>>>,
}

impl FunctionStore {
    pub fn new(
        repo: Arc<dyn FunctionRepository>,
        tracker: Arc<ExecutionTracker>,
        sandbox: Sandbox,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            repo,
            tracker,
            sandbox,
            default_limits,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Validate and persist a function body.
    ///
    /// Identical code under the same name returns the existing record
    /// untouched; new code becomes a new version and the new `latest`.
    pub async fn store_function(&self, request: StoreRequest) -> CoreResult<FunctionRecord> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.contains('@') {
            return Err(CoreError::validation(
                &request.name,
                "function names must be non-empty and must not contain '@'",
            ));
        }

        let resource_limits = request.limits.unwrap_or(self.default_limits);
        let limits = sandbox_limits(&name, &resource_limits)?;
        let allowed = parse_capabilities(&name, &request.allowed_capabilities)?;
        for (stage, schema) in [
            (SchemaStage::Input, &request.input_schema),
            (SchemaStage::Output, &request.output_schema),
        ] {
            check_schema(schema)
                .map_err(|e| CoreError::validation(&name, format!("{stage} schema {e}")))?;
        }

        let program = sandbox::compile(&request.code, &allowed)
            .map_err(|e| CoreError::from_sandbox(&name, e, &limits))?;

        let record = FunctionRecord {
            name: name.clone(),
            description: request.description,
            version: FunctionVersion::from_code(&request.code),
            code: request.code,
            input_schema: request.input_schema,
            output_schema: request.output_schema,
            resource_limits,
            allowed_capabilities: request.allowed_capabilities,
            is_async: request.is_async,
            created_at: Utc::now(),
        };
        let version = record.version.clone();

        let created = self.repo.insert_version(record.clone()).await?;
        obs::emit_function_stored(&name, &version, created);
        if !created {
            return Ok(self.repo.get_version(&name, &version).await?);
        }

        self.compiled.write().insert(
            (name, version),
            Arc::new(CompiledFunction {
                record: record.clone(),
                program,
                limits,
            }),
        );
        Ok(record)
    }

    /// Run a function as the root of a new conversation.
    pub async fn execute_function(
        &self,
        name: &str,
        version: &VersionRef,
        args: Value,
    ) -> CoreResult<Value> {
        let ctx = ChainContext::fresh();
        let span = obs::conversation_span(&ctx.conversation_id);
        self.execute_within(&ctx, name, version, args)
            .instrument(span)
            .await
    }

    /// Run a function nested under `ctx.parent_execution_id`, at `ctx.depth`.
    pub async fn execute_within(
        &self,
        ctx: &ChainContext,
        name: &str,
        version: &VersionRef,
        args: Value,
    ) -> CoreResult<Value> {
        METRICS.inc_function_executions();

        let compiled = match self.resolve(name, version).await {
            Ok(compiled) => compiled,
            Err(error) => {
                let scope = self.tracker.open(NewExecution::new(
                    ExecutionKind::Function,
                    name,
                    ctx,
                    args,
                ));
                scope.fail(&error);
                return Err(error);
            }
        };

        let record = &compiled.record;
        let scope = self.tracker.open(
            NewExecution::new(ExecutionKind::Function, name, ctx, args.clone())
                .with_version(record.version.clone()),
        );

        if let Err(error) = validate_for(name, SchemaStage::Input, &record.input_schema, &args) {
            scope.fail(&error);
            return Err(error);
        }

        scope.start();
        let result = self
            .sandbox
            .run(name, &compiled.program, compiled.limits, args)
            .await
            .map_err(|e| CoreError::from_sandbox(name, e, &compiled.limits))
            .and_then(|output| {
                validate_for(name, SchemaStage::Output, &record.output_schema, &output)?;
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

    /// The stored record for `name` at `version`.
    pub async fn get(&self, name: &str, version: &VersionRef) -> CoreResult<FunctionRecord> {
        let record = match version {
            VersionRef::Latest => self.repo.latest(name).await,
            VersionRef::Exact(v) => self.repo.get_version(name, v).await,
        };
        record.map_err(|e| not_found(name, e))
    }

    /// Versions of `name`, oldest first.
    pub async fn versions(&self, name: &str) -> CoreResult<Vec<FunctionVersion>> {
        self.repo.versions(name).await.map_err(|e| not_found(name, e))
    }

    /// Latest record of every stored function, by name.
    pub async fn list_functions(&self) -> CoreResult<Vec<FunctionRecord>> {
        let mut records = Vec::new();
        for name in self.repo.list_names().await? {
            records.push(self.repo.latest(&name).await?);
        }
        Ok(records)
    }

    async fn resolve(&self, name: &str, version: &VersionRef) -> CoreResult<Arc<CompiledFunction>> {
        if let VersionRef::Exact(v) = version {
            if let Some(hit) = self.compiled.read().get(&(name.to_string(), v.clone())) {
                return Ok(hit.clone());
            }
        }

        let record = self.get(name, version).await?;
        let key = (record.name.clone(), record.version.clone());
        if let Some(hit) = self.compiled.read().get(&key) {
            return Ok(hit.clone());
        }

        let compiled = Arc::new(compile_record(record)?);
        self.compiled.write().insert(key, compiled.clone());
        Ok(compiled)
    }
}

impl std::fmt::Debug for FunctionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionStore")
            .field("compiled", &self.compiled.read().len())
            .finish()
    }
}
