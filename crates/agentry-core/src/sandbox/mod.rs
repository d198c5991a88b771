//! Sandbox: a restricted interpreter for stored functions.
//!
//! Code is parsed and statically checked against a capability allow-list
//! once, when it is stored. Each execution then walks the shared, immutable
//! program in a fresh interpreter with its own memory and time budget, and
//! re-checks every module call against the granted capabilities.
//!
//! # Modules
//!
//! - [`capability`]: `Capability` enum (math, time, log, fs, net)
//! - [`lexer`], [`parser`], [`ast`]: source text to `Program`
//! - [`analyzer`]: static, default-deny capability analysis
//! - [`interpreter`]: tree-walking evaluator with runtime enforcement
//! - [`builtins`]: core builtins and the `math`/`time`/`log` modules
//! - [`host`]: `HostModule` providers for `fs`/`net`
//! - [`budget`]: memory footprint and deadline accounting
//! - [`execution`]: `run_isolated()` on the blocking pool
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod analyzer;
pub mod ast;
pub mod budget;
pub mod builtins;
pub mod capability;
pub mod error;
pub mod execution;
pub mod host;
pub mod interpreter;
pub mod lexer;
pub mod parser;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

pub use analyzer::{analyze, Analysis};
pub use ast::Program;
pub use capability::Capability;
pub use error::{SandboxError, SandboxResult};
pub use execution::{run_isolated, RunRequest, SandboxLimits};
pub use host::{HostModule, HostModules, ReadOnlyFs};

/// A parsed and analyzed function body, ready to run any number of times.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub program: Arc<Program>,
    pub analysis: Analysis,
}

/// Parse `source` and check it against `allowed`.
pub fn compile(source: &str, allowed: &BTreeSet<Capability>) -> SandboxResult<CompiledProgram> {
    let program = parser::parse(source)?;
    let analysis = analyze(&program, allowed)?;
    Ok(CompiledProgram {
        program: Arc::new(program),
        analysis,
    })
}

/// Host-side sandbox configuration shared by every run.
#[derive(Debug, Clone)]
pub struct Sandbox {
    hosts: HostModules,
    grace: Duration,
}

impl Sandbox {
    pub fn new(hosts: HostModules, grace: Duration) -> Self {
        Self { hosts, grace }
    }

    pub fn hosts(&self) -> &HostModules {
        &self.hosts
    }

    /// Execute `compiled` in an isolated context; only imported modules are granted.
    pub async fn run(
        &self,
        origin: &str,
        compiled: &CompiledProgram,
        limits: SandboxLimits,
        input: Value,
    ) -> SandboxResult<Value> {
        let request = RunRequest {
            origin: origin.to_string(),
            program: compiled.program.clone(),
            granted: compiled.analysis.imports.clone(),
            limits,
            input,
        };
        run_isolated(request, self.hosts.clone(), self.grace).await
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(HostModules::new(), Duration::from_millis(250))
    }
}
