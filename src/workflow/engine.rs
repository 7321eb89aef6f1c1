//! The workflow engine: registration, admission, the scheduler loop and
//! execution history.
//!
//! The scheduler repeatedly launches every `PENDING` step whose
//! dependencies are all `COMPLETED` and whose condition holds, under a
//! global step-concurrency budget shared by all workflows. When nothing is
//! running and pending steps remain, the workflow fails with `Deadlock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::ToolInvoker;
use crate::config::OrchestratorConfig;
use crate::error::{CallError, OrchestratorError};
use crate::events::{EventDispatcher, OrchestratorEvent};
use crate::workflow::condition::evaluate_condition;
use crate::workflow::definition::{validate_definition, StepDefinition, WorkflowDefinition};
use crate::workflow::interpolate::interpolate_value;
use crate::workflow::saga::{compensation_applies, run_compensation};
use crate::workflow::state::{
    ExecutionStatus, StepState, WorkflowExecution, WorkflowState,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub workflows_started: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    pub workflows_compensated: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub active_workflows: usize,
    pub registered_workflows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub variables: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
}

struct HistoryEntry {
    stored_at: Instant,
    execution: Arc<RwLock<WorkflowExecution>>,
}

pub struct WorkflowEngine {
    config: OrchestratorConfig,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    active: DashMap<String, Arc<RwLock<WorkflowExecution>>>,
    history: DashMap<String, HistoryEntry>,
    invoker: Arc<dyn ToolInvoker>,
    dispatcher: EventDispatcher,
    step_budget: Arc<Semaphore>,
    metrics: Arc<Mutex<EngineMetrics>>,
}

impl WorkflowEngine {
    pub fn new(
        config: OrchestratorConfig,
        invoker: Arc<dyn ToolInvoker>,
        dispatcher: EventDispatcher,
    ) -> Self {
        let step_budget = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));
        Self {
            config,
            definitions: DashMap::new(),
            active: DashMap::new(),
            history: DashMap::new(),
            invoker,
            dispatcher,
            step_budget,
            metrics: Arc::new(Mutex::new(EngineMetrics::default())),
        }
    }

    /// Registers a workflow definition; re-registering a name replaces the
    /// previous definition for subsequent executions.
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, OrchestratorError> {
        validate_definition(&definition)?;
        let definition = Arc::new(definition);
        if self
            .definitions
            .insert(definition.name.clone(), definition.clone())
            .is_some()
        {
            info!(workflow = %definition.name, "workflow definition replaced");
        } else {
            info!(workflow = %definition.name, "workflow registered");
        }
        Ok(definition)
    }

    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self.definitions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Runs a workflow to completion, returning the map of completed step
    /// results. Admission is bounded by `max_concurrent_workflows`.
    pub async fn execute_workflow(
        &self,
        name: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<Value, OrchestratorError> {
        let definition = self
            .definitions
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(name.to_string()))?;

        let active = self.active.len();
        if active >= self.config.max_concurrent_workflows {
            return Err(OrchestratorError::Overloaded {
                active,
                limit: self.config.max_concurrent_workflows,
            });
        }

        let execution = Arc::new(RwLock::new(WorkflowExecution::new(
            definition.clone(),
            input,
            options.variables,
            options.metadata,
        )));
        let workflow_id = execution.read().workflow_id.clone();
        self.active.insert(workflow_id.clone(), execution.clone());
        self.metrics.lock().workflows_started += 1;

        execution.write().state = WorkflowState::Running;
        self.dispatcher.emit(OrchestratorEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            name: definition.name.clone(),
            timestamp: Utc::now(),
        });

        let deadlocked = self.run_scheduler(&definition, &execution).await;
        let outcome = self.finalize(&definition, &execution, deadlocked).await;

        self.active.remove(&workflow_id);
        self.prune_history();
        self.history.insert(
            workflow_id,
            HistoryEntry {
                stored_at: Instant::now(),
                execution,
            },
        );
        outcome
    }

    /// Marks a workflow cancelled. The scheduler stops launching steps;
    /// in-flight steps drain to their natural end, then compensation runs.
    pub fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let execution = self
            .active
            .get(workflow_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(workflow_id.to_string()))?;
        let newly_cancelled = {
            let mut guard = execution.write();
            if guard.state.is_terminal() {
                false
            } else {
                guard.state = WorkflowState::Cancelled;
                guard.cancel_reason = Some(reason.to_string());
                true
            }
        };
        if newly_cancelled {
            info!(workflow_id, reason, "workflow cancelled");
            self.dispatcher.emit(OrchestratorEvent::WorkflowCancelled {
                workflow_id: workflow_id.to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    pub fn get_workflow_status(&self, workflow_id: &str) -> Option<ExecutionStatus> {
        if let Some(execution) = self.active.get(workflow_id) {
            return Some(execution.read().status());
        }
        self.prune_history();
        self.history
            .get(workflow_id)
            .map(|entry| entry.execution.read().status())
    }

    pub fn list_active_executions(&self) -> Vec<ExecutionStatus> {
        self.active
            .iter()
            .map(|entry| entry.value().read().status())
            .collect()
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        let mut metrics = self.metrics.lock().clone();
        metrics.active_workflows = self.active.len();
        metrics.registered_workflows = self.definitions.len();
        metrics
    }

    /// Drives the scheduler until every step is terminal or the workflow is
    /// cancelled. Returns the blocked step names on deadlock.
    async fn run_scheduler(
        &self,
        definition: &Arc<WorkflowDefinition>,
        execution: &Arc<RwLock<WorkflowExecution>>,
    ) -> Option<Vec<String>> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(definition.timeout_ms);
        let workflow_id = execution.read().workflow_id.clone();
        let mut in_flight: JoinSet<String> = JoinSet::new();

        loop {
            let cancelled = execution.read().state != WorkflowState::Running;

            let mut launched = 0usize;
            let mut skipped = Vec::new();
            if !cancelled {
                let to_start: Vec<StepDefinition> = {
                    let guard = execution.read();
                    let context = guard.context_value();
                    definition
                        .steps
                        .iter()
                        .filter(|step| {
                            guard
                                .steps
                                .get(&step.name)
                                .map(|s| s.state == StepState::Pending)
                                .unwrap_or(false)
                        })
                        .filter(|step| {
                            step.depends_on.iter().all(|dep| {
                                guard
                                    .steps
                                    .get(dep)
                                    .map(|s| s.state == StepState::Completed)
                                    .unwrap_or(false)
                            })
                        })
                        .filter(|step| match &step.condition {
                            Some(condition) => {
                                if evaluate_condition(condition, &context) {
                                    true
                                } else {
                                    skipped.push(step.name.clone());
                                    false
                                }
                            }
                            None => true,
                        })
                        .cloned()
                        .collect()
                };

                for name in &skipped {
                    {
                        let mut guard = execution.write();
                        if let Some(state) = guard.steps.get_mut(name) {
                            state.state = StepState::Skipped;
                            state.end_time = Some(Utc::now());
                        }
                    }
                    debug!(workflow_id = %workflow_id, step = %name, "condition false, step skipped");
                    self.dispatcher.emit(OrchestratorEvent::StepSkipped {
                        workflow_id: workflow_id.clone(),
                        step: name.clone(),
                        reason: "condition evaluated to false".to_string(),
                        timestamp: Utc::now(),
                    });
                }

                for step in to_start {
                    {
                        let mut guard = execution.write();
                        if let Some(state) = guard.steps.get_mut(&step.name) {
                            state.state = StepState::Running;
                            state.start_time = Some(Utc::now());
                        }
                    }
                    launched += 1;
                    in_flight.spawn(run_step(
                        step,
                        execution.clone(),
                        self.invoker.clone(),
                        self.dispatcher.clone(),
                        self.step_budget.clone(),
                        self.metrics.clone(),
                        workflow_id.clone(),
                    ));
                }
            }

            if in_flight.is_empty() {
                let (all_terminal, blocked) = {
                    let guard = execution.read();
                    let all_terminal =
                        guard.steps.values().all(|s| s.state.is_terminal());
                    let blocked: Vec<String> = definition
                        .steps
                        .iter()
                        .filter(|step| {
                            guard
                                .steps
                                .get(&step.name)
                                .map(|s| s.state == StepState::Pending)
                                .unwrap_or(false)
                        })
                        .map(|step| step.name.clone())
                        .collect();
                    (all_terminal, blocked)
                };
                if cancelled || all_terminal {
                    return None;
                }
                if launched == 0 && skipped.is_empty() && !blocked.is_empty() {
                    warn!(workflow_id = %workflow_id, blocked = ?blocked, "workflow deadlocked");
                    return Some(blocked);
                }
                // A skip this round may have changed nothing launchable;
                // re-evaluate before declaring deadlock.
                continue;
            }

            if cancelled {
                // Drain in-flight steps without the workflow deadline.
                let _ = in_flight.join_next().await;
                continue;
            }
            match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(workflow_id = %workflow_id, "workflow timeout");
                    self.cancel_active(execution, "timeout");
                }
            }
        }
    }

    fn cancel_active(&self, execution: &Arc<RwLock<WorkflowExecution>>, reason: &str) {
        let workflow_id = {
            let mut guard = execution.write();
            if guard.state.is_terminal() {
                return;
            }
            guard.state = WorkflowState::Cancelled;
            guard.cancel_reason = Some(reason.to_string());
            guard.workflow_id.clone()
        };
        self.dispatcher.emit(OrchestratorEvent::WorkflowCancelled {
            workflow_id,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn finalize(
        &self,
        definition: &Arc<WorkflowDefinition>,
        execution: &Arc<RwLock<WorkflowExecution>>,
        deadlocked: Option<Vec<String>>,
    ) -> Result<Value, OrchestratorError> {
        enum Outcome {
            Completed(Value, u64),
            Failed(String),
            Cancelled(String),
        }

        let workflow_id = execution.read().workflow_id.clone();
        let outcome = {
            let mut guard = execution.write();
            if guard.state == WorkflowState::Cancelled {
                guard.end_time = Some(Utc::now());
                Outcome::Cancelled(
                    guard
                        .cancel_reason
                        .clone()
                        .unwrap_or_else(|| "cancelled".to_string()),
                )
            } else {
                // A critical step can only reach SKIPPED through its own
                // condition, which is not a failure; FAILED criticals and
                // deadlocks are.
                let critical_failed = definition
                    .steps
                    .iter()
                    .filter(|step| step.critical)
                    .any(|step| {
                        guard
                            .steps
                            .get(&step.name)
                            .map(|s| s.state == StepState::Failed)
                            .unwrap_or(false)
                    });
                if !critical_failed && deadlocked.is_none() {
                    let result = guard.collect_result();
                    guard.state = WorkflowState::Completed;
                    guard.result = Some(result.clone());
                    guard.end_time = Some(Utc::now());
                    let duration = (Utc::now() - guard.start_time)
                        .num_milliseconds()
                        .max(0) as u64;
                    Outcome::Completed(result, duration)
                } else {
                    let error = match &deadlocked {
                        Some(blocked) => OrchestratorError::Deadlock {
                            blocked: blocked.clone(),
                        }
                        .to_string(),
                        None => guard
                            .steps
                            .iter()
                            .find(|(_, s)| s.state == StepState::Failed)
                            .and_then(|(name, s)| {
                                s.error
                                    .as_ref()
                                    .map(|e| format!("step '{name}' failed: {e}"))
                            })
                            .unwrap_or_else(|| "workflow failed".to_string()),
                    };
                    guard.state = WorkflowState::Failed;
                    guard.error = Some(error.clone());
                    guard.end_time = Some(Utc::now());
                    Outcome::Failed(error)
                }
            }
        };

        match &outcome {
            Outcome::Completed(_, duration) => {
                self.dispatcher.emit(OrchestratorEvent::WorkflowCompleted {
                    workflow_id: workflow_id.clone(),
                    name: definition.name.clone(),
                    duration_ms: *duration,
                    timestamp: Utc::now(),
                });
            }
            Outcome::Failed(error) => {
                self.dispatcher.emit(OrchestratorEvent::WorkflowFailed {
                    workflow_id: workflow_id.clone(),
                    name: definition.name.clone(),
                    error: error.clone(),
                    timestamp: Utc::now(),
                });
            }
            // workflow_cancelled was emitted when cancellation was requested.
            Outcome::Cancelled(_) => {}
        }

        if compensation_applies(&execution.read()) {
            run_compensation(definition, execution, &self.invoker, &self.dispatcher).await;
            self.metrics.lock().workflows_compensated += 1;
        }

        {
            let mut metrics = self.metrics.lock();
            match &outcome {
                Outcome::Completed(..) => metrics.workflows_completed += 1,
                Outcome::Failed(_) => metrics.workflows_failed += 1,
                Outcome::Cancelled(_) => metrics.workflows_cancelled += 1,
            }
        }

        match outcome {
            Outcome::Completed(result, _) => Ok(result),
            Outcome::Cancelled(reason) => Err(OrchestratorError::Cancelled {
                workflow_id,
                reason,
            }),
            Outcome::Failed(_) => {
                if let Some(blocked) = deadlocked {
                    return Err(OrchestratorError::Deadlock { blocked });
                }
                let guard = execution.read();
                let failed = guard
                    .steps
                    .iter()
                    .find(|(_, s)| s.state == StepState::Failed);
                match failed {
                    Some((name, state)) => Err(OrchestratorError::StepFailed {
                        step: name.clone(),
                        error: state
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    }),
                    None => Err(OrchestratorError::Internal(
                        guard
                            .error
                            .clone()
                            .unwrap_or_else(|| "workflow failed".to_string()),
                    )),
                }
            }
        }
    }

    fn prune_history(&self) {
        let retention = self.config.history_retention();
        self.history
            .retain(|_, entry| entry.stored_at.elapsed() < retention);
    }
}

/// One step's lifetime: acquire a budget permit, then attempt the call up
/// to `retries + 1` times. Each attempt interpolates params against the
/// current context and runs under the step's own deadline.
async fn run_step(
    step: StepDefinition,
    execution: Arc<RwLock<WorkflowExecution>>,
    invoker: Arc<dyn ToolInvoker>,
    dispatcher: EventDispatcher,
    budget: Arc<Semaphore>,
    metrics: Arc<Mutex<EngineMetrics>>,
    workflow_id: String,
) -> String {
    let _permit = match budget.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return step.name,
    };

    loop {
        let attempt = {
            let mut guard = execution.write();
            match guard.steps.get_mut(&step.name) {
                Some(state) => {
                    state.attempt += 1;
                    state.attempt
                }
                None => return step.name,
            }
        };
        dispatcher.emit(OrchestratorEvent::StepStarted {
            workflow_id: workflow_id.clone(),
            step: step.name.clone(),
            mcp: step.mcp.clone(),
            attempt,
            timestamp: Utc::now(),
        });

        let context = execution.read().context_value();
        let params = interpolate_value(&step.params, &context);
        let step_timeout = step.timeout_ms.map(Duration::from_millis);

        let call = invoker.call_tool(&step.mcp, &step.action, params, step_timeout);
        let outcome = match step_timeout {
            // The step deadline bounds one attempt; a retry gets a fresh
            // timer.
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Call(CallError::Timeout(
                    timeout.as_millis() as u64,
                ))),
            },
            None => call.await,
        };

        match outcome {
            Ok(result) => {
                {
                    let mut guard = execution.write();
                    let index = guard.next_completion_index();
                    if let Some(state) = guard.steps.get_mut(&step.name) {
                        state.state = StepState::Completed;
                        state.result = Some(result);
                        state.end_time = Some(Utc::now());
                        state.completion_index = Some(index);
                    }
                }
                metrics.lock().steps_completed += 1;
                dispatcher.emit(OrchestratorEvent::StepCompleted {
                    workflow_id: workflow_id.clone(),
                    step: step.name.clone(),
                    timestamp: Utc::now(),
                });
                return step.name;
            }
            Err(error) => {
                if attempt <= step.retries {
                    debug!(
                        workflow_id = %workflow_id,
                        step = %step.name,
                        attempt,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    continue;
                }
                let message = error.to_string();
                if step.critical {
                    {
                        let mut guard = execution.write();
                        if let Some(state) = guard.steps.get_mut(&step.name) {
                            state.state = StepState::Failed;
                            state.error = Some(message.clone());
                            state.end_time = Some(Utc::now());
                        }
                    }
                    metrics.lock().steps_failed += 1;
                    warn!(workflow_id = %workflow_id, step = %step.name, error = %message, "critical step failed");
                    dispatcher.emit(OrchestratorEvent::StepFailed {
                        workflow_id: workflow_id.clone(),
                        step: step.name.clone(),
                        error: message,
                        timestamp: Utc::now(),
                    });
                } else {
                    {
                        let mut guard = execution.write();
                        if let Some(state) = guard.steps.get_mut(&step.name) {
                            state.state = StepState::Skipped;
                            state.error = Some(message.clone());
                            state.end_time = Some(Utc::now());
                        }
                    }
                    dispatcher.emit(OrchestratorEvent::StepSkipped {
                        workflow_id: workflow_id.clone(),
                        step: step.name.clone(),
                        reason: format!("retries exhausted: {message}"),
                        timestamp: Utc::now(),
                    });
                }
                return step.name;
            }
        }
    }
}
