//! Error taxonomy for the agent crate (context, tools, driver, workflow).

use agentforge_core::Severity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("path escapes project directory: {0}")]
    PathEscape(String),

    #[error("path touches an ignored location: {0}")]
    IgnoredPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("old_text not found in {0}")]
    OldTextNotFound(String),

    #[error("invalid line range {start}..{end} for {path} ({lines} lines)")]
    InvalidLineRange { path: String, start: usize, end: usize, lines: usize },

    #[error("selection crosses control flow: {0}")]
    UnsupportedPattern(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("check runner failed: {0}")]
    CheckRunnerFailed(String),

    #[error("test runner failed: {0}")]
    TestRunnerFailed(String),
}

impl Severity for ToolError {
    fn is_fatal(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("context failed schema validation: {0}")]
    Invalid(String),
}

impl Severity for ContextError {
    fn is_fatal(&self) -> bool {
        // any context-validation failure is fatal, not recoverable
        true
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("malformed_response: {0}")]
    MalformedResponse(String),

    #[error("model invocation failed: {0}")]
    InvocationFailed(String),
}

impl Severity for DriverError {
    fn is_fatal(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] agentforge_core::StoreError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("precomputation failed: {0}")]
    PrecomputeFailed(String),

    #[error("lock busy for task {0}")]
    LockBusy(String),
}

impl Severity for WorkflowError {
    fn is_fatal(&self) -> bool {
        match self {
            WorkflowError::Store(e) => e.is_fatal(),
            WorkflowError::Context(e) => e.is_fatal(),
            WorkflowError::LockBusy(_) => true,
            _ => false,
        }
    }
}
