pub mod call_error;
pub mod orchestrator_error;

pub use call_error::CallError;
pub use orchestrator_error::{OrchestratorError, OrchestratorResult};
