//! Per-execution state: step records and the workflow context.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::workflow::definition::WorkflowDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Compensating,
    Compensated,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed
                | StepState::Failed
                | StepState::Skipped
                | StepState::Compensated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Compensating,
    Compensated,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::Failed
                | WorkflowState::Cancelled
                | WorkflowState::Compensated
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepExecution {
    pub state: StepState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attempt: u32,
    /// Monotone index assigned at completion; drives reverse-order
    /// compensation.
    pub completion_index: Option<u64>,
    pub compensation_error: Option<String>,
}

impl StepExecution {
    fn new() -> Self {
        Self {
            state: StepState::Pending,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
            attempt: 0,
            completion_index: None,
            compensation_error: None,
        }
    }
}

/// One workflow execution. Owned exclusively by the engine while active;
/// moved to the bounded history map at a terminal state.
#[derive(Debug)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub definition: Arc<WorkflowDefinition>,
    /// Frozen at submission.
    pub input: Value,
    pub steps: HashMap<String, StepExecution>,
    pub state: WorkflowState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub variables: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub cancel_reason: Option<String>,
    completion_counter: u64,
}

impl WorkflowExecution {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        input: Value,
        variables: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|step| (step.name.clone(), StepExecution::new()))
            .collect();
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            definition,
            input,
            steps,
            state: WorkflowState::Pending,
            result: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            variables,
            metadata,
            cancel_reason: None,
            completion_counter: 0,
        }
    }

    pub fn next_completion_index(&mut self) -> u64 {
        self.completion_counter += 1;
        self.completion_counter
    }

    /// Interpolation root: `input`, `workflowId`, `steps.<name>.result`,
    /// `variables` and `metadata`.
    pub fn context_value(&self) -> Value {
        let mut steps = Map::new();
        for (name, execution) in &self.steps {
            steps.insert(
                name.clone(),
                json!({
                    "state": execution.state,
                    "result": execution.result.clone().unwrap_or(Value::Null),
                    "error": execution.error.clone().map(Value::String).unwrap_or(Value::Null),
                }),
            );
        }
        json!({
            "workflowId": self.workflow_id,
            "input": self.input,
            "steps": Value::Object(steps),
            "variables": map_to_object(&self.variables),
            "metadata": map_to_object(&self.metadata),
        })
    }

    /// Successful outcome: completed step results keyed by step name.
    pub fn collect_result(&self) -> Value {
        let mut out = Map::new();
        for step in &self.definition.steps {
            if let Some(execution) = self.steps.get(&step.name) {
                if execution.state == StepState::Completed {
                    out.insert(
                        step.name.clone(),
                        execution.result.clone().unwrap_or(Value::Null),
                    );
                }
            }
        }
        Value::Object(out)
    }

    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus {
            workflow_id: self.workflow_id.clone(),
            name: self.definition.name.clone(),
            state: self.state,
            steps: self
                .definition
                .steps
                .iter()
                .filter_map(|step| {
                    self.steps.get(&step.name).map(|execution| StepStatus {
                        name: step.name.clone(),
                        state: execution.state,
                        attempt: execution.attempt,
                        error: execution.error.clone(),
                    })
                })
                .collect(),
            result: self.result.clone(),
            error: self.error.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

fn map_to_object(map: &HashMap<String, Value>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Serializable snapshot handed to the gateway layer.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub workflow_id: String,
    pub name: String,
    pub state: WorkflowState,
    pub steps: Vec<StepStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub name: String,
    pub state: StepState,
    pub attempt: u32,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{CompensationStrategy, StepDefinition};

    fn definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            name: "wf".into(),
            version: "1.0.0".into(),
            description: String::new(),
            timeout_ms: 300_000,
            max_retries: 0,
            compensation_strategy: CompensationStrategy::ReverseOrder,
            steps: vec![StepDefinition {
                name: "a".into(),
                mcp: "svc".into(),
                action: "run".into(),
                params: json!({}),
                timeout_ms: None,
                retries: 0,
                condition: None,
                compensation: None,
                parallel: false,
                critical: true,
                depends_on: vec![],
            }],
        })
    }

    #[test]
    fn context_exposes_step_results() {
        let mut execution = WorkflowExecution::new(
            definition(),
            json!({"user": "ada"}),
            HashMap::new(),
            HashMap::new(),
        );
        if let Some(step) = execution.steps.get_mut("a") {
            step.state = StepState::Completed;
            step.result = Some(json!({"id": "u1"}));
        }
        let ctx = execution.context_value();
        assert_eq!(ctx["input"]["user"], "ada");
        assert_eq!(ctx["steps"]["a"]["result"]["id"], "u1");
        assert_eq!(ctx["workflowId"], execution.workflow_id.as_str());
    }

    #[test]
    fn completion_indices_are_monotone() {
        let mut execution =
            WorkflowExecution::new(definition(), json!({}), HashMap::new(), HashMap::new());
        assert_eq!(execution.next_completion_index(), 1);
        assert_eq!(execution.next_completion_index(), 2);
    }
}
