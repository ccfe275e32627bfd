pub mod dag;
pub mod executor;
pub mod output;
pub mod step_executor;

pub use dag::{DependencyEdge, Readiness, WorkflowDag};
pub use executor::WorkflowExecutor;
pub use output::{OutputReporter, StepFailure};
pub use step_executor::{captured_output, CapturedOutput, StepExecutor, StepResult};
