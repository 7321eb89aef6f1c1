//! Saga compensation: undoing completed steps of a failed or cancelled
//! workflow.
//!
//! Compensation is best-effort: a failing compensation is recorded and the
//! pass moves on to the next step. The terminal workflow state after a
//! compensation pass is `COMPENSATED`.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::ToolInvoker;
use crate::events::{EventDispatcher, OrchestratorEvent};
use crate::workflow::definition::{CompensationStrategy, StepDefinition, WorkflowDefinition};
use crate::workflow::interpolate::interpolate_value;
use crate::workflow::state::{StepState, WorkflowExecution, WorkflowState};

/// Whether a compensation pass applies: the workflow failed or was
/// cancelled, and at least one completed step defines a compensation.
pub fn compensation_applies(execution: &WorkflowExecution) -> bool {
    matches!(
        execution.state,
        WorkflowState::Failed | WorkflowState::Cancelled
    ) && execution.definition.steps.iter().any(|step| {
        step.compensation.is_some()
            && execution
                .steps
                .get(&step.name)
                .map(|s| s.state == StepState::Completed)
                .unwrap_or(false)
    })
}

pub async fn run_compensation(
    definition: &WorkflowDefinition,
    execution: &Arc<RwLock<WorkflowExecution>>,
    invoker: &Arc<dyn ToolInvoker>,
    dispatcher: &EventDispatcher,
) {
    let workflow_id = execution.read().workflow_id.clone();

    // Completed steps with a compensation, in the order they completed.
    let mut targets: Vec<(StepDefinition, u64)> = {
        let guard = execution.read();
        definition
            .steps
            .iter()
            .filter_map(|step| {
                let state = guard.steps.get(&step.name)?;
                if state.state == StepState::Completed && step.compensation.is_some() {
                    Some((step.clone(), state.completion_index.unwrap_or(0)))
                } else {
                    None
                }
            })
            .collect()
    };
    match definition.compensation_strategy {
        CompensationStrategy::ReverseOrder => {
            targets.sort_by(|a, b| b.1.cmp(&a.1));
        }
        // Definition order is how `targets` was collected.
        CompensationStrategy::InOrder => {}
    }

    execution.write().state = WorkflowState::Compensating;
    dispatcher.emit(OrchestratorEvent::WorkflowCompensationStarted {
        workflow_id: workflow_id.clone(),
        steps: targets.iter().map(|(step, _)| step.name.clone()).collect(),
        timestamp: Utc::now(),
    });

    for (step, _) in targets {
        let compensation = match &step.compensation {
            Some(compensation) => compensation.clone(),
            None => continue,
        };
        let context = {
            let mut guard = execution.write();
            if let Some(state) = guard.steps.get_mut(&step.name) {
                state.state = StepState::Compensating;
            }
            compensation_context(&guard, &step.name)
        };
        let params = interpolate_value(&compensation.params, &context);
        let target = compensation.mcp.as_deref().unwrap_or(&step.mcp);

        match invoker
            .call_tool(target, &compensation.action, params, None)
            .await
        {
            Ok(_) => {
                info!(workflow_id = %workflow_id, step = %step.name, "step compensated");
                if let Some(state) = execution.write().steps.get_mut(&step.name) {
                    state.state = StepState::Compensated;
                }
                dispatcher.emit(OrchestratorEvent::StepCompensated {
                    workflow_id: workflow_id.clone(),
                    step: step.name.clone(),
                    timestamp: Utc::now(),
                });
            }
            Err(error) => {
                warn!(
                    workflow_id = %workflow_id,
                    step = %step.name,
                    error = %error,
                    "compensation failed; continuing"
                );
                if let Some(state) = execution.write().steps.get_mut(&step.name) {
                    state.compensation_error = Some(error.to_string());
                }
                dispatcher.emit(OrchestratorEvent::StepCompensationFailed {
                    workflow_id: workflow_id.clone(),
                    step: step.name.clone(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    {
        let mut guard = execution.write();
        guard.state = WorkflowState::Compensated;
        guard.end_time = Some(Utc::now());
    }
    dispatcher.emit(OrchestratorEvent::WorkflowCompensated {
        workflow_id,
        timestamp: Utc::now(),
    });
}

/// The regular interpolation root plus a `compensation` subtree carrying
/// the original outcome of the step being compensated.
fn compensation_context(execution: &WorkflowExecution, step_name: &str) -> Value {
    let mut context = execution.context_value();
    let (original_result, original_error) = execution
        .steps
        .get(step_name)
        .map(|state| (state.result.clone(), state.error.clone()))
        .unwrap_or((None, None));
    if let Value::Object(map) = &mut context {
        map.insert(
            "compensation".to_string(),
            json!({
                "original_result": original_result.unwrap_or(Value::Null),
                "original_error": original_error.map(Value::String).unwrap_or(Value::Null),
            }),
        );
    }
    context
}
