//! Error taxonomy for the core crate.
//!
//! Mirrors the kind-not-type taxonomy in the design: every error here is
//! either `Recoverable` (surfaced to the model as an `ERROR: ...` string and
//! counted against loop budgets) or `Fatal` (caught at the step boundary,
//! forcing a transition to `failed`).

use thiserror::Error;

/// Errors raised by the State Store (C1).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("lock busy: could not acquire state.lock for task {0} within timeout")]
    LockBusy(String),

    #[error("state corrupt: {0}")]
    StateCorrupt(String),

    #[error("unknown schema version {found}, expected {expected}")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("no such task: {0}")]
    TaskNotFound(String),

    #[error("transaction already committed or rolled back")]
    TransactionClosed,
}

/// Errors raised by the Fact Store (C2).
#[derive(Error, Debug)]
pub enum FactError {
    #[error("unknown fact id: {0}")]
    NotFound(String),

    #[error("supersedes target {0} not found in store")]
    SupersedesMissing(String),
}

/// Errors raised by the Phase Machine (C3).
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("no legal transition from {from:?} given current context")]
    NoLegalTransition { from: String },

    #[error("transition {from:?} -> {to:?} is not a registered edge")]
    UnregisteredTransition { from: String, to: String },
}

/// Classifies an error as fatal (terminates the task) or recoverable
/// (surfaced to the model and counted against loop budgets).
pub trait Severity {
    fn is_fatal(&self) -> bool;
}

impl Severity for StoreError {
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StateCorrupt(_) | StoreError::SchemaVersion { .. } | StoreError::LockBusy(_)
        )
    }
}

impl Severity for FactError {
    fn is_fatal(&self) -> bool {
        false
    }
}

impl Severity for PhaseError {
    fn is_fatal(&self) -> bool {
        false
    }
}
