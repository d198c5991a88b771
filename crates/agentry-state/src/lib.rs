//! Agentry-State: record shapes and storage for the Agentry execution core
//!
//! This crate is the persistence layer consumed by `agentry-core`. It owns
//! the data shapes that cross the storage boundary and the traits a backend
//! must implement; the execution core never talks to a concrete store.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: immutable definitions, content-versioned functions, stable JSON
//! shapes for execution records.
//!
//! ## Key Components
//!
//! - `AgentDefinition`: data-driven description of an agent
//! - `FunctionRecord`: one immutable, content-versioned function body
//! - `ExecutionRecord`: audit entry for a single invocation
//! - `DefinitionStore` / `FunctionRepository`: backend-agnostic storage traits
//! - `fakes`: in-memory backends; `JsonFileStore`: directory-backed backend

mod error;
pub mod fakes;
pub mod json_store;
pub mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use json_store::JsonFileStore;
pub use schema::{
    AgentDefinition, AgentKind, CallTarget, ChainStrategy, ErrorKind, ErrorReport, ExecutionId,
    ExecutionKind, ExecutionRecord, ExecutionStatus, FunctionRecord, GenerationParams,
    InputBinding, PlanOutput, PlanStep, ResourceLimits,
};
pub use storage_traits::{DefinitionStore, FunctionRepository, FunctionVersion, StorageResult};
