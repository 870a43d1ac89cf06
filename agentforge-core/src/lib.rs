//! Deterministic core of the fix loop: data model, durable state store,
//! fact store, and phase machine (C1-C3).

pub mod error;
pub mod facts;
pub mod phase;
pub mod store;
pub mod types;

pub use error::{FactError, PhaseError, Severity, StoreError};
pub use facts::{FactStore, ScoringWeights};
pub use phase::{can_transition, should_auto_transition, validate_transition, PhaseContext, TerminalRequest};
pub use store::{TaskPaths, Txn};
pub use types::{
    ActionDef, ActionOutcome, ActionRecord, ComplexityMetrics, EscalationRecord, ExtractionSuggestion, Fact,
    FactCategory, Phase, PhaseHistory, PhaseState, PrecomputedContext, ResolutionRecord, Task, TaskId, Violation,
    ViolatingFunction, VerificationState,
};
