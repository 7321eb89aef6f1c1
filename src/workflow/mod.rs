//! Declarative workflows: definitions, interpolation, condition gating,
//! the scheduler and saga compensation.

pub mod condition;
pub mod definition;
pub mod engine;
pub mod interpolate;
pub mod saga;
pub mod state;

pub use condition::evaluate_condition;
pub use definition::{
    validate_definition, CompensationSpec, CompensationStrategy, StepDefinition,
    WorkflowDefinition,
};
pub use engine::{EngineMetrics, ExecuteOptions, WorkflowEngine};
pub use interpolate::{interpolate_string, interpolate_value};
pub use state::{ExecutionStatus, StepExecution, StepState, StepStatus, WorkflowExecution, WorkflowState};
