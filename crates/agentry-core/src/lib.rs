//! Agentry Core Library
//!
//! The execution core: a sandboxed, content-versioned Function Store, an
//! append-only Execution Tracker, the Agent Factory, and the Agent Registry
//! that resolves, caches, chains, and records agent invocations.

pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod function_store;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod sandbox;
pub mod schema;
pub mod telemetry;
pub mod tracker;

pub use config::{ConfigError, EngineConfig};
pub use context::ChainContext;
pub use error::{CoreError, CoreResult};
pub use factory::{
    AgentFactory, AgentInstance, CallRequest, Delegate, FnTool, Invocation, ModelClient,
    ModelReply, ModelRequest, Observation, ResolvedTool, ScriptedModelClient, Strategy,
    ToolDescriptor, ToolHandler, Toolbox,
};
pub use function_store::{FunctionStore, StoreRequest, VersionRef};
pub use registry::{ProcessOutcome, Registry};
pub use sandbox::{Capability, HostModule, HostModules, ReadOnlyFs, Sandbox};
pub use schema::SchemaStage;
pub use telemetry::init_tracing;
pub use tracker::{ExecutionNode, ExecutionScope, ExecutionTracker, NewExecution, TrackerError};

pub use agentry_state::{
    AgentDefinition, AgentKind, CallTarget, ChainStrategy, ErrorKind, ErrorReport, ExecutionId,
    ExecutionKind, ExecutionRecord, ExecutionStatus, FunctionRecord, FunctionVersion,
    GenerationParams, InputBinding, PlanOutput, PlanStep, ResourceLimits,
};
