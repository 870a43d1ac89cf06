//! Runtime guardrails for the fix loop: loop detection and the adaptive
//! step budget (C4).

pub mod budget;
pub mod error;
pub mod loop_detector;

pub use budget::{AdaptiveBudget, BudgetConfig};
pub use error::LoopError;
pub use loop_detector::{LoopDetection, LoopDetector, LoopKind, LoopThresholds};
