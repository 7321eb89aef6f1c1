//! Workflow and step definitions, immutable after registration.

use std::collections::{HashMap, HashSet};

use petgraph::stable_graph::StableDiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    ReverseOrder,
    InOrder,
}

impl Default for CompensationStrategy {
    fn default() -> Self {
        CompensationStrategy::ReverseOrder
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Outer deadline for the whole execution.
    #[serde(default = "default_workflow_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub compensation_strategy: CompensationStrategy,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Target service name in the discovery registry.
    pub mcp: String,
    /// Tool invoked on the target.
    pub action: String,
    #[serde(default = "default_params")]
    pub params: Value,
    /// Deadline for a single attempt; retries get a fresh timer.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    /// Skips the step when it evaluates to false.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub compensation: Option<CompensationSpec>,
    /// Hint only; actual parallelism follows the dependency graph.
    #[serde(default)]
    pub parallel: bool,
    /// A failed critical step fails the workflow; a non-critical one is
    /// skipped.
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Defaults to the step's own service.
    #[serde(default)]
    pub mcp: Option<String>,
    pub action: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

/// Registration-time validation: unique step names, dependencies naming
/// existing siblings, and an acyclic dependency graph.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), OrchestratorError> {
    if definition.name.is_empty() {
        return Err(OrchestratorError::Validation(
            "workflow name is required".to_string(),
        ));
    }
    if definition.steps.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "workflow '{}' has no steps",
            definition.name
        )));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if step.name.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}': step with empty name",
                definition.name
            )));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}': duplicate step '{}'",
                definition.name, step.name
            )));
        }
        if step.mcp.is_empty() || step.action.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}': step '{}' needs both mcp and action",
                definition.name, step.name
            )));
        }
    }

    let mut graph: StableDiGraph<&str, ()> = StableDiGraph::new();
    let mut indices = HashMap::new();
    for step in &definition.steps {
        indices.insert(step.name.as_str(), graph.add_node(step.name.as_str()));
    }
    for step in &definition.steps {
        let target = indices[step.name.as_str()];
        for dependency in &step.depends_on {
            let Some(&source) = indices.get(dependency.as_str()) else {
                return Err(OrchestratorError::Validation(format!(
                    "workflow '{}': step '{}' depends on unknown step '{}'",
                    definition.name, step.name, dependency
                )));
            };
            graph.add_edge(source, target, ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(OrchestratorError::Validation(format!(
            "workflow '{}': dependency cycle detected",
            definition.name
        )));
    }
    Ok(())
}

fn default_version() -> String {
    "1.0.0".to_string()
}
fn default_workflow_timeout_ms() -> u64 {
    300_000
}
fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}
fn default_true() -> bool {
    true
}
