//! Model-driven agents and the model collaborator interface.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agentry_state::GenerationParams;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CallRequest, Invocation, Strategy};
use crate::error::{CoreError, CoreResult};

/// What the model sees on one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub agent: String,
    pub system_prompt: String,
    pub generation: GenerationParams,
    pub input: Value,
    /// Tools the agent may call by name.
    pub tools: Vec<String>,
    /// Results of calls requested on earlier turns, oldest first.
    pub observations: Vec<Observation>,
    /// Zero-based.
    pub turn: u32,
}

/// A call the model asked for and what it returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub call: CallRequest,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelReply {
    /// The agent's answer.
    Final { output: Value },
    /// Calls to run before the next turn.
    Calls { calls: Vec<CallRequest> },
}

/// Language-model collaborator.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, String>;
}

/// Replays canned replies per agent, in order. Records every request.
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    replies: Mutex<HashMap<String, VecDeque<ModelReply>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for the next turn of `agent`.
    pub fn with_reply(self, agent: impl Into<String>, reply: ModelReply) -> Self {
        self.push(agent, reply);
        self
    }

    pub fn push(&self, agent: impl Into<String>, reply: ModelReply) {
        self.replies
            .lock()
            .entry(agent.into())
            .or_default()
            .push_back(reply);
    }

    /// Load a script shaped as `{"agent": [reply, ...], ...}`.
    pub fn from_json(script: Value) -> Result<Self, serde_json::Error> {
        let parsed: HashMap<String, VecDeque<ModelReply>> = serde_json::from_value(script)?;
        Ok(Self {
            replies: Mutex::new(parsed),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, String> {
        self.requests.lock().push(request.clone());
        self.replies
            .lock()
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| format!("no scripted reply left for agent '{}'", request.agent))
    }
}

/// Turn loop: ask the model, run the calls it wants, feed results back.
pub(crate) struct ModelAgent {
    client: Arc<dyn ModelClient>,
    max_turns: u32,
}

impl ModelAgent {
    pub(crate) fn new(client: Arc<dyn ModelClient>, max_turns: u32) -> Self {
        Self { client, max_turns }
    }
}

#[async_trait]
impl Strategy for ModelAgent {
    async fn run(&self, invocation: &Invocation<'_>, input: Value) -> CoreResult<Value> {
        let definition = invocation.definition();
        let name = definition.name.as_str();
        let mut observations = Vec::new();

        for turn in 0..self.max_turns {
            let request = ModelRequest {
                agent: name.to_string(),
                system_prompt: definition.system_prompt.clone(),
                generation: definition.generation.clone(),
                input: input.clone(),
                tools: invocation.tool_names(),
                observations: observations.clone(),
                turn,
            };
            let reply = self
                .client
                .complete(&request)
                .await
                .map_err(|e| CoreError::execution(name, format!("model client failed: {e}")))?;

            match reply {
                ModelReply::Final { output } => return Ok(output),
                ModelReply::Calls { calls } if calls.is_empty() => {
                    return Err(CoreError::execution(
                        name,
                        "model replied with neither calls nor a final output",
                    ));
                }
                ModelReply::Calls { calls } => {
                    tracing::debug!(agent = %name, turn, calls = calls.len(), "model requested calls");
                    let outputs = invocation.call_all(calls.clone()).await?;
                    observations.extend(
                        calls
                            .into_iter()
                            .zip(outputs)
                            .map(|(call, output)| Observation { call, output }),
                    );
                }
            }
        }

        Err(CoreError::execution(
            name,
            format!("no final output after {} model turns", self.max_turns),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_wire_shape() {
        let reply: ModelReply = serde_json::from_value(json!({
            "type": "calls",
            "calls": [{"target": {"type": "tool", "name": "double"}, "input": {"x": 2}}]
        }))
        .unwrap();
        assert_eq!(
            reply,
            ModelReply::Calls {
                calls: vec![CallRequest::tool("double", json!({"x": 2}))]
            }
        );
    }

    #[tokio::test]
    async fn test_scripted_client_replays_in_order() {
        let client = ScriptedModelClient::from_json(json!({
            "a": [
                {"type": "calls", "calls": []},
                {"type": "final", "output": 7}
            ]
        }))
        .unwrap();
        let request = ModelRequest {
            agent: "a".into(),
            system_prompt: String::new(),
            generation: GenerationParams::default(),
            input: json!(null),
            tools: Vec::new(),
            observations: Vec::new(),
            turn: 0,
        };

        assert!(matches!(
            client.complete(&request).await.unwrap(),
            ModelReply::Calls { .. }
        ));
        assert_eq!(
            client.complete(&request).await.unwrap(),
            ModelReply::Final { output: json!(7) }
        );
        assert!(client.complete(&request).await.is_err());
        assert_eq!(client.requests().len(), 3);
    }
}
