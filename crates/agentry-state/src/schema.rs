//! Record shapes shared by every storage backend and the execution core.
//!
//! Records:
//! - `AgentDefinition`: what an agent is allowed to do and how it behaves
//! - `FunctionRecord`: one stored, immutable function version
//! - `ExecutionRecord`: one invocation of an agent, tool, or function

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage_traits::FunctionVersion;

fn any_schema() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_max_chain_depth() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Agent definitions
// ---------------------------------------------------------------------------

/// How an agent runs the calls issued by one step or model turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStrategy {
    /// One call at a time, in issue order.
    #[default]
    Sequential,
    /// Calls run concurrently, bounded by the engine's parallelism limit.
    Parallel,
}

/// Model sampling parameters. Opaque to the core; forwarded to the model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Something an agent can call: a tool/function (leaf) or another agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum CallTarget {
    Tool(String),
    Agent(String),
}

impl CallTarget {
    pub fn name(&self) -> &str {
        match self {
            CallTarget::Tool(name) | CallTarget::Agent(name) => name,
        }
    }
}

impl std::fmt::Display for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallTarget::Tool(name) => write!(f, "tool:{name}"),
            CallTarget::Agent(name) => write!(f, "agent:{name}"),
        }
    }
}

/// Where a plan step takes its input from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBinding {
    /// The input the agent itself received.
    #[default]
    Forward,
    /// The output of the preceding step (sequential plans only).
    Previous,
    /// A fixed value.
    Value(Value),
}

/// What a plan agent returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutput {
    /// Output of the last step.
    #[default]
    Last,
    /// Array of every step output, in step order.
    Collect,
}

/// One step of a declarative plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub target: CallTarget,
    #[serde(default)]
    pub input: InputBinding,
}

/// The behaviour family of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentKind {
    /// Driven turn by turn by the model collaborator.
    #[default]
    Model,
    /// A fixed list of calls; needs no model.
    Plan {
        steps: Vec<PlanStep>,
        #[serde(default)]
        output: PlanOutput,
    },
}

/// Data-driven agent definition. Immutable once registered; replaced, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique key.
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub system_prompt: String,

    /// JSON-Schema-style description of accepted input.
    #[serde(default = "any_schema")]
    pub input_schema: Value,

    /// JSON-Schema-style description of produced output.
    #[serde(default = "any_schema")]
    pub output_schema: Value,

    /// Tool and function names this agent may call. Functions may be pinned
    /// to a version with `name@<version>`.
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,

    /// Deepest chain depth at which this agent may run.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,

    #[serde(default)]
    pub fallback_agent_name: Option<String>,

    #[serde(default)]
    pub chain_strategy: ChainStrategy,

    #[serde(default)]
    pub generation: GenerationParams,

    #[serde(default)]
    pub kind: AgentKind,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl AgentDefinition {
    /// A model-driven agent with permissive schemas and default limits.
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
            input_schema: any_schema(),
            output_schema: any_schema(),
            allowed_tools: BTreeSet::new(),
            max_chain_depth: default_max_chain_depth(),
            fallback_agent_name: None,
            chain_strategy: ChainStrategy::Sequential,
            generation: GenerationParams::default(),
            kind: AgentKind::Model,
            is_active: true,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.allowed_tools.insert(tool.into());
        self
    }

    pub fn with_max_chain_depth(mut self, depth: u32) -> Self {
        self.max_chain_depth = depth;
        self
    }

    pub fn with_fallback(mut self, agent: impl Into<String>) -> Self {
        self.fallback_agent_name = Some(agent.into());
        self
    }

    pub fn with_strategy(mut self, strategy: ChainStrategy) -> Self {
        self.chain_strategy = strategy;
        self
    }

    pub fn with_schemas(mut self, input: Value, output: Value) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    pub fn with_plan(mut self, steps: Vec<PlanStep>, output: PlanOutput) -> Self {
        self.kind = AgentKind::Plan { steps, output };
        self
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// Resource ceiling for one function execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_limit_mb: u64,
    pub timeout_seconds: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 128,
            timeout_seconds: 30.0,
        }
    }
}

/// One stored function version. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub code: String,
    pub version: FunctionVersion,
    pub input_schema: Value,
    pub output_schema: Value,
    pub resource_limits: ResourceLimits,
    /// Sandbox modules the code may use.
    pub allowed_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub is_async: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Unique identifier for an execution record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    /// Generate a new random ExecutionId
    pub fn new() -> Self {
        ExecutionId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of unit an execution record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Agent,
    Tool,
    Function,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionKind::Agent => write!(f, "agent"),
            ExecutionKind::Tool => write!(f, "tool"),
            ExecutionKind::Function => write!(f, "function"),
        }
    }
}

/// Lifecycle: `Pending → Running → {Completed | Failed | TimedOut}`.
/// `Pending → Failed` is allowed for calls rejected before they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Stable, user-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "SandboxViolationError")]
    SandboxViolation,
    #[serde(rename = "MemoryLimitError")]
    MemoryLimit,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "ExecutionError")]
    Execution,
    #[serde(rename = "ChainDepthExceededError")]
    ChainDepthExceeded,
    #[serde(rename = "CacheEvictionRace")]
    CacheEvictionRace,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::SandboxViolation => "SandboxViolationError",
            ErrorKind::MemoryLimit => "MemoryLimitError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::ChainDepthExceeded => "ChainDepthExceededError",
            ErrorKind::CacheEvictionRace => "CacheEvictionRace",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail attached to records and outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Audit entry for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    /// Agent, tool, or function name.
    pub target: String,
    pub kind: ExecutionKind,
    /// Function version, for function executions.
    pub version: Option<FunctionVersion>,
    /// `None` only at the root of a chain.
    pub parent_execution_id: Option<ExecutionId>,
    pub conversation_id: String,
    pub depth: u32,
    pub input: Value,
    pub output: Option<Value>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorReport>,
    /// Set when this node is a fallback attempt replacing a failed node.
    pub fallback_for: Option<ExecutionId>,
}

impl ExecutionRecord {
    /// Wall-clock duration between start (or creation) and finish.
    pub fn duration_ms(&self) -> Option<u64> {
        let finished = self.finished_at?;
        let started = self.started_at.unwrap_or(self.created_at);
        Some((finished - started).num_milliseconds().max(0) as u64)
    }
}
