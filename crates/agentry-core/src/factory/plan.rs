//! Declarative plan agents: a fixed list of calls, no model involved.

use agentry_state::{AgentDefinition, CallTarget, ChainStrategy, InputBinding, PlanOutput, PlanStep};
use async_trait::async_trait;
use serde_json::Value;

use super::{CallRequest, Invocation, Strategy, Toolbox};
use crate::error::{CoreError, CoreResult};

pub(crate) struct PlanAgent {
    steps: Vec<PlanStep>,
    output: PlanOutput,
}

impl PlanAgent {
    /// Reject plans that could never run as written.
    pub(crate) fn new(
        definition: &AgentDefinition,
        steps: Vec<PlanStep>,
        output: PlanOutput,
        toolbox: &Toolbox,
    ) -> CoreResult<Self> {
        let parallel = definition.chain_strategy == ChainStrategy::Parallel;
        for (i, step) in steps.iter().enumerate() {
            if parallel && step.input == InputBinding::Previous {
                return Err(CoreError::validation(
                    &definition.name,
                    format!("step {i} binds 'previous' but the plan runs in parallel"),
                ));
            }
            if let CallTarget::Tool(tool) = &step.target {
                if !toolbox.contains(tool) {
                    return Err(CoreError::execution(
                        &definition.name,
                        format!("step {i} calls tool '{tool}' which is not in allowed_tools"),
                    ));
                }
            }
        }
        Ok(Self { steps, output })
    }

    fn bind(binding: &InputBinding, input: &Value, previous: Option<&Value>) -> Value {
        match binding {
            InputBinding::Forward => input.clone(),
            InputBinding::Previous => previous.unwrap_or(input).clone(),
            InputBinding::Value(value) => value.clone(),
        }
    }
}

#[async_trait]
impl Strategy for PlanAgent {
    async fn run(&self, invocation: &Invocation<'_>, input: Value) -> CoreResult<Value> {
        let mut outputs = match invocation.definition().chain_strategy {
            ChainStrategy::Parallel => {
                let calls = self
                    .steps
                    .iter()
                    .map(|step| CallRequest {
                        target: step.target.clone(),
                        input: Self::bind(&step.input, &input, None),
                    })
                    .collect();
                invocation.call_all(calls).await?
            }
            ChainStrategy::Sequential => {
                let mut outputs: Vec<Value> = Vec::with_capacity(self.steps.len());
                for step in &self.steps {
                    let call = CallRequest {
                        target: step.target.clone(),
                        input: Self::bind(&step.input, &input, outputs.last()),
                    };
                    outputs.push(invocation.call(call).await?);
                }
                outputs
            }
        };

        Ok(match self.output {
            PlanOutput::Last => outputs.pop().unwrap_or(Value::Null),
            PlanOutput::Collect => Value::Array(outputs),
        })
    }
}
