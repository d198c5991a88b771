//! Chain context threaded through every invocation.

use agentry_state::ExecutionId;
use serde::{Deserialize, Serialize};

/// Where an invocation sits in its conversation's execution tree.
///
/// Immutable: moving down the chain produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainContext {
    pub conversation_id: String,
    /// Delegation hops from the top-level request.
    pub depth: u32,
    /// The record this invocation is nested under; `None` at the root.
    pub parent_execution_id: Option<ExecutionId>,
}

impl ChainContext {
    /// Context for a top-level request.
    pub fn root(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            depth: 0,
            parent_execution_id: None,
        }
    }

    /// Root context with a freshly generated conversation id.
    pub fn fresh() -> Self {
        Self::root(uuid::Uuid::new_v4().to_string())
    }

    /// Same depth, nested under `parent`. Used for leaf calls made by an agent.
    pub fn within(&self, parent: &ExecutionId) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            depth: self.depth,
            parent_execution_id: Some(parent.clone()),
        }
    }

    /// One hop deeper, for delegating to another agent.
    pub fn descend(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            depth: self.depth + 1,
            parent_execution_id: self.parent_execution_id.clone(),
        }
    }
}
