//! Agent layer of the fix loop: context building, tool handlers, the LLM
//! driver, the per-step executor, and the fix workflow that drives a task
//! from a violation record to a terminal outcome (C5-C9).

pub mod cli;
pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod precompute;
pub mod tools;
pub mod transaction;
pub mod workflow;

pub use context::{ContextBuilder, StepContext};
pub use driver::{AgentResponse, HumanInTheLoopDriver, LlmDriver};
#[cfg(feature = "http-driver")]
pub use driver::HttpDriver;
pub use executor::{Executor, StepOutcome};
pub use workflow::{FixWorkflow, WorkflowOutcome};
