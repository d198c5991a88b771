//! Execution Tracker: append-only arena of execution records.
//!
//! Records are opened through [`ExecutionTracker::open`], which hands back an
//! [`ExecutionScope`] guard. The guard is the only writer for its record and
//! guarantees a terminal status: dropping it unfinished marks the record
//! failed as abandoned.

use std::collections::HashMap;
use std::sync::Arc;

use agentry_state::{
    ErrorKind, ErrorReport, ExecutionId, ExecutionKind, ExecutionRecord, ExecutionStatus,
    FunctionVersion,
};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::context::ChainContext;
use crate::error::CoreError;
use crate::obs;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("unknown execution: {id}")]
    UnknownExecution { id: ExecutionId },

    #[error("execution {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// What to record when opening a new execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub kind: ExecutionKind,
    pub target: String,
    pub version: Option<FunctionVersion>,
    pub context: ChainContext,
    pub input: Value,
    pub fallback_for: Option<ExecutionId>,
}

impl NewExecution {
    pub fn new(kind: ExecutionKind, target: impl Into<String>, context: &ChainContext, input: Value) -> Self {
        Self {
            kind,
            target: target.into(),
            version: None,
            context: context.clone(),
            input,
            fallback_for: None,
        }
    }

    pub fn with_version(mut self, version: FunctionVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn replacing(mut self, failed: Option<ExecutionId>) -> Self {
        self.fallback_for = failed;
        self
    }
}

/// A record and everything nested under it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionNode {
    pub record: ExecutionRecord,
    pub children: Vec<ExecutionNode>,
}

#[derive(Default)]
struct Arena {
    records: Vec<ExecutionRecord>,
    index: HashMap<ExecutionId, usize>,
    by_conversation: HashMap<String, Vec<usize>>,
    children: HashMap<ExecutionId, Vec<usize>>,
}

impl Arena {
    fn collect(&self, slots: Option<&Vec<usize>>) -> Vec<ExecutionRecord> {
        slots
            .map(|slots| slots.iter().map(|&i| self.records[i].clone()).collect())
            .unwrap_or_default()
    }

    fn node(&self, slot: usize) -> ExecutionNode {
        let record = self.records[slot].clone();
        let children = self
            .children
            .get(&record.id)
            .map(|kids| kids.iter().map(|&i| self.node(i)).collect())
            .unwrap_or_default();
        ExecutionNode { record, children }
    }
}

/// Shared, thread-safe store of every execution record.
#[derive(Default)]
pub struct ExecutionTracker {
    arena: RwLock<Arena>,
}

impl ExecutionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a `pending` record and return the guard that owns it.
    pub fn open(self: &Arc<Self>, new: NewExecution) -> ExecutionScope {
        let id = ExecutionId::new();
        let record = ExecutionRecord {
            id: id.clone(),
            target: new.target,
            kind: new.kind,
            version: new.version,
            parent_execution_id: new.context.parent_execution_id,
            conversation_id: new.context.conversation_id,
            depth: new.context.depth,
            input: new.input,
            output: None,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            fallback_for: new.fallback_for,
        };
        obs::emit_execution_opened(
            &id,
            record.kind,
            &record.target,
            record.depth,
            record.parent_execution_id.as_ref(),
        );

        {
            let mut arena = self.arena.write();
            let slot = arena.records.len();
            arena.index.insert(id.clone(), slot);
            arena
                .by_conversation
                .entry(record.conversation_id.clone())
                .or_default()
                .push(slot);
            if let Some(parent) = &record.parent_execution_id {
                arena.children.entry(parent.clone()).or_default().push(slot);
            }
            arena.records.push(record);
        }

        ExecutionScope {
            tracker: Arc::clone(self),
            id,
            finished: false,
        }
    }

    /// Move a record to `to`. Terminal records are never reopened.
    pub fn transition(
        &self,
        id: &ExecutionId,
        to: ExecutionStatus,
        output: Option<Value>,
        error: Option<ErrorReport>,
    ) -> Result<(), TrackerError> {
        let finished = {
            let mut arena = self.arena.write();
            let slot = *arena
                .index
                .get(id)
                .ok_or_else(|| TrackerError::UnknownExecution { id: id.clone() })?;
            let record = &mut arena.records[slot];

            let allowed = match (record.status, to) {
                (ExecutionStatus::Pending, ExecutionStatus::Running) => true,
                (ExecutionStatus::Pending, ExecutionStatus::Failed) => true,
                (ExecutionStatus::Running, next) => next.is_terminal(),
                _ => false,
            };
            if !allowed {
                return Err(TrackerError::IllegalTransition {
                    id: id.clone(),
                    from: record.status,
                    to,
                });
            }

            let now = Utc::now();
            record.status = to;
            if to == ExecutionStatus::Running {
                record.started_at = Some(now);
                None
            } else {
                record.finished_at = Some(now);
                record.output = output;
                record.error = error;
                Some((record.target.clone(), record.duration_ms().unwrap_or(0)))
            }
        };

        if let Some((target, duration_ms)) = finished {
            obs::emit_execution_finished(id, &target, to, duration_ms);
        }
        Ok(())
    }

    pub fn get(&self, id: &ExecutionId) -> Option<ExecutionRecord> {
        let arena = self.arena.read();
        arena.index.get(id).map(|&slot| arena.records[slot].clone())
    }

    /// Every record of one conversation, in creation order.
    pub fn by_conversation(&self, conversation_id: &str) -> Vec<ExecutionRecord> {
        let arena = self.arena.read();
        arena.collect(arena.by_conversation.get(conversation_id))
    }

    /// Direct children of `id`, in creation order.
    pub fn children(&self, id: &ExecutionId) -> Vec<ExecutionRecord> {
        let arena = self.arena.read();
        arena.collect(arena.children.get(id))
    }

    pub fn by_target(&self, target: &str) -> Vec<ExecutionRecord> {
        self.arena
            .read()
            .records
            .iter()
            .filter(|r| r.target == target)
            .cloned()
            .collect()
    }

    /// Root-first trees for one conversation.
    pub fn tree(&self, conversation_id: &str) -> Vec<ExecutionNode> {
        let arena = self.arena.read();
        let Some(slots) = arena.by_conversation.get(conversation_id) else {
            return Vec::new();
        };
        slots
            .iter()
            .copied()
            .filter(|&slot| {
                // roots, plus records whose parent lives in another conversation
                arena.records[slot]
                    .parent_execution_id
                    .as_ref()
                    .and_then(|p| arena.index.get(p))
                    .map_or(true, |&p| arena.records[p].conversation_id != conversation_id)
            })
            .map(|slot| arena.node(slot))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.arena.read().records.clone()
    }

    pub fn len(&self) -> usize {
        self.arena.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ExecutionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTracker")
            .field("records", &self.len())
            .finish()
    }
}

/// Sole writer for one open record.
#[must_use = "dropping a scope marks its record as abandoned"]
pub struct ExecutionScope {
    tracker: Arc<ExecutionTracker>,
    id: ExecutionId,
    finished: bool,
}

impl ExecutionScope {
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    /// `pending -> running`.
    pub fn start(&self) {
        self.apply(ExecutionStatus::Running, None, None);
    }

    pub fn complete(mut self, output: Value) {
        self.finished = true;
        self.apply(ExecutionStatus::Completed, Some(output), None);
    }

    /// Terminal failure; timeouts are recorded as `timed_out`.
    pub fn fail(mut self, error: &CoreError) {
        self.finished = true;
        let status = if error.kind() == ErrorKind::Timeout {
            ExecutionStatus::TimedOut
        } else {
            ExecutionStatus::Failed
        };
        self.apply(status, None, Some(error.report()));
    }

    fn apply(&self, to: ExecutionStatus, output: Option<Value>, error: Option<ErrorReport>) {
        if let Err(e) = self.tracker.transition(&self.id, to, output, error) {
            tracing::warn!(error = %e, "execution record not updated");
        }
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        if !self.finished {
            let report = ErrorReport {
                kind: ErrorKind::Execution,
                message: "execution abandoned before completion".to_string(),
            };
            self.apply(ExecutionStatus::Failed, None, Some(report));
        }
    }
}

impl std::fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open(tracker: &Arc<ExecutionTracker>, target: &str, ctx: &ChainContext) -> ExecutionScope {
        tracker.open(NewExecution::new(ExecutionKind::Agent, target, ctx, json!({})))
    }

    #[test]
    fn test_lifecycle_completed() {
        let tracker = ExecutionTracker::new();
        let scope = open(&tracker, "a", &ChainContext::root("c"));
        let id = scope.id().clone();
        assert_eq!(tracker.get(&id).unwrap().status, ExecutionStatus::Pending);

        scope.start();
        assert!(tracker.get(&id).unwrap().started_at.is_some());
        scope.complete(json!({"ok": true}));

        let record = tracker.get(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.output, Some(json!({"ok": true})));
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_timeout_maps_to_timed_out() {
        let tracker = ExecutionTracker::new();
        let scope = open(&tracker, "slow", &ChainContext::root("c"));
        let id = scope.id().clone();
        scope.start();
        scope.fail(&CoreError::Timeout {
            target: "slow".into(),
            limit_ms: 1000,
        });
        let record = tracker.get(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::TimedOut);
        assert_eq!(record.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_pending_may_fail_directly() {
        let tracker = ExecutionTracker::new();
        let scope = open(&tracker, "a", &ChainContext::root("c"));
        let id = scope.id().clone();
        scope.fail(&CoreError::validation("a", "bad input"));
        assert_eq!(tracker.get(&id).unwrap().status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_dropped_scope_is_abandoned() {
        let tracker = ExecutionTracker::new();
        let id = {
            let scope = open(&tracker, "a", &ChainContext::root("c"));
            scope.start();
            scope.id().clone()
        };
        let record = tracker.get(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.unwrap().message.contains("abandoned"));
    }

    #[test]
    fn test_terminal_records_never_reopen() {
        let tracker = ExecutionTracker::new();
        let scope = open(&tracker, "a", &ChainContext::root("c"));
        let id = scope.id().clone();
        scope.start();
        scope.complete(json!(1));

        let err = tracker
            .transition(&id, ExecutionStatus::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, TrackerError::IllegalTransition { .. }));

        let err = tracker
            .transition(&ExecutionId::new(), ExecutionStatus::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, TrackerError::UnknownExecution { .. }));
    }

    #[test]
    fn test_indices_and_tree() {
        let tracker = ExecutionTracker::new();
        let root_ctx = ChainContext::root("conv");
        let root = open(&tracker, "root", &root_ctx);
        root.start();

        let inner = root_ctx.within(root.id());
        let first = tracker.open(NewExecution::new(ExecutionKind::Tool, "t1", &inner, json!(1)));
        let second = open(&tracker, "child", &inner.descend());
        let other = open(&tracker, "elsewhere", &ChainContext::root("other"));

        assert_eq!(tracker.children(root.id()).len(), 2);
        assert_eq!(tracker.by_conversation("conv").len(), 3);
        assert_eq!(tracker.by_target("t1").len(), 1);
        assert_eq!(tracker.len(), 4);

        let tree = tracker.tree("conv");
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].record.target, "root");
        let kids: Vec<&str> = tree[0].children.iter().map(|n| n.record.target.as_str()).collect();
        assert_eq!(kids, vec!["t1", "child"]);

        for scope in [first, second, other] {
            scope.fail(&CoreError::execution("x", "done"));
        }
        root.complete(json!(null));
        assert!(tracker.snapshot().iter().all(|r| r.status.is_terminal()));
    }
}
