//! Isolated execution: one blocking-pool thread per run, bounded by a deadline.
//!
//! The deadline is wall-clock from the moment the interpreter starts, not from
//! when the run was queued. The interpreter checks it cooperatively; the caller
//! additionally waits at most `timeout + grace` before giving up on the thread
//! and reporting a timeout.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::ast::Program;
use super::budget::Budget;
use super::capability::Capability;
use super::error::{SandboxError, SandboxResult};
use super::host::HostModules;
use super::interpreter::Interpreter;

/// Memory and time ceiling for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxLimits {
    /// Ceiling on the run's live value footprint, in megabytes.
    pub memory_limit_mb: u64,
    /// Wall-clock budget measured from interpreter start.
    pub timeout: Duration,
}

impl SandboxLimits {
    /// Create limits from a megabyte ceiling and a wall-clock budget.
    pub fn new(memory_limit_mb: u64, timeout: Duration) -> Self {
        Self {
            memory_limit_mb,
            timeout,
        }
    }

    /// Timeout in whole milliseconds, as reported in `TimeoutError`s.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Raises the cancel flag when the waiting future goes away, for any reason.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Everything a run needs, owned so it can move onto the blocking pool.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Function name, used in guest log lines and error messages.
    pub origin: String,
    /// Compiled program, shared with every other run of the same version.
    pub program: Arc<Program>,
    /// Capabilities the function was stored with; re-checked on every module call.
    pub granted: BTreeSet<Capability>,
    /// Memory and time ceiling for this run.
    pub limits: SandboxLimits,
    /// Arguments, bound as top-level variables when the input is an object.
    pub input: Value,
}

/// Run `request` on tokio's blocking pool and wait for the result.
///
/// Each call builds a fresh interpreter and budget, so no state survives
/// between runs. The caller waits at most `limits.timeout + grace`:
///
/// * the interpreter notices an expired deadline at its next step or sleep
///   and returns `SandboxError::Timeout`;
/// * if the thread overruns the grace period anyway, the cancel flag is
///   raised, the thread is detached, and the same timeout error is returned.
///
/// Dropping the returned future also raises the cancel flag, so an abandoned
/// run stops at its next check.
///
/// # Errors
///
/// Propagates the interpreter's `SandboxError`. A panicked or cancelled
/// blocking task is reported as `SandboxError::Runtime`.
pub async fn run_isolated(
    request: RunRequest,
    hosts: HostModules,
    grace: Duration,
) -> SandboxResult<Value> {
    let cancel = Arc::new(AtomicBool::new(false));
    let _guard = CancelOnDrop(cancel.clone());
    let limits = request.limits;
    let (started_tx, started_rx) = oneshot::channel::<()>();

    let flag = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let budget = Budget::new(limits.memory_limit_mb, limits.timeout, flag);
        let _ = started_tx.send(());
        Interpreter::new(&request.origin, &request.granted, &hosts, budget)
            .run(&request.program, &request.input)
    });

    // Sender dropped without sending only if the closure never ran; the join
    // below reports that.
    let _ = started_rx.await;

    match tokio::time::timeout(limits.timeout + grace, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(SandboxError::Runtime {
            line: 0,
            message: format!("sandbox thread failed: {join_error}"),
        }),
        Err(_elapsed) => {
            cancel.store(true, Ordering::Relaxed);
            tracing::warn!(
                limit_ms = limits.timeout_ms(),
                grace_ms = grace.as_millis() as u64,
                "sandbox thread missed its deadline; detaching"
            );
            Err(SandboxError::Timeout {
                limit_ms: limits.timeout_ms(),
            })
        }
    }
}
