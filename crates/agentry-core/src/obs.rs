//! Structured lifecycle events for executions.
//!
//! Every emitter logs at `info!` (or `warn!` for rejections) with an `event`
//! field so log pipelines can filter on it.

use agentry_state::{ExecutionId, ExecutionKind, ExecutionStatus, FunctionVersion};
use tracing::{info, warn};

/// Span covering one top-level request and everything it delegates to.
///
/// Attach it with `tracing::Instrument` rather than entering it, since the
/// request future is awaited across threads.
pub fn conversation_span(conversation_id: &str) -> tracing::Span {
    tracing::info_span!("agentry.conversation", conversation_id = %conversation_id)
}

pub fn emit_execution_opened(
    id: &ExecutionId,
    kind: ExecutionKind,
    target: &str,
    depth: u32,
    parent: Option<&ExecutionId>,
) {
    info!(
        event = "execution.opened",
        execution_id = %id,
        kind = %kind,
        target = %target,
        depth = depth,
        parent = parent.map(|p| p.0.as_str()).unwrap_or("-"),
    );
}

pub fn emit_execution_finished(
    id: &ExecutionId,
    target: &str,
    status: ExecutionStatus,
    duration_ms: u64,
) {
    info!(
        event = "execution.finished",
        execution_id = %id,
        target = %target,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_depth_rejected(agent: &str, depth: u32, max: u32) {
    warn!(event = "chain.depth_rejected", agent = %agent, depth = depth, max = max);
}

pub fn emit_fallback(failed: &ExecutionId, agent: &str, fallback: &str) {
    info!(
        event = "agent.fallback",
        failed_execution = %failed,
        agent = %agent,
        fallback = %fallback,
    );
}

pub fn emit_function_stored(name: &str, version: &FunctionVersion, created: bool) {
    info!(
        event = "function.stored",
        function = %name,
        version = %version.short(),
        created = created,
    );
}

pub fn emit_agent_registered(name: &str, invalidated: usize) {
    info!(event = "agent.registered", agent = %name, invalidated = invalidated);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_span_scopes_events() {
        let span = conversation_span("conv-1");
        span.in_scope(|| emit_depth_rejected("a", 4, 3));
    }
}
