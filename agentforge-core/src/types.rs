//! Data model for the fix loop.
//!
//! All types here are plain value objects. Validation happens at the
//! boundaries that construct them (Fix Workflow, Tool Handlers), not via
//! runtime reflection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Stable identifier for a task. Wraps a string so it can key a filesystem
/// path (`.agentforge/tasks/<task_id>/`) and a HashMap alike.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The conformance violation that gave rise to a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub check_id: String,
    pub severity: String,
    pub file_path: String,
    pub line_number: Option<usize>,
    pub message: String,
    pub fix_hint: Option<String>,
    pub test_path: Option<String>,
}

/// Immutable identity plus mutable state of a fix task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: String,
    pub goal: String,
    pub success_criteria: Vec<String>,
    pub constraints: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub violation: Violation,
}

impl Task {
    pub fn new_fix_violation(task_id: TaskId, violation: Violation, created_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            task_type: "fix_violation".to_string(),
            goal: format!(
                "Eliminate violation {} ({}) in {}",
                violation.check_id, violation.id, violation.file_path
            ),
            success_criteria: vec![
                "conformance check passes".to_string(),
                "test suite passes".to_string(),
            ],
            constraints: Vec::new(),
            created_at,
            violation,
        }
    }
}

/// Coarse state in the fix lifecycle. Order here is the "phase order" used
/// by `should_auto_transition` to prefer strictly-forward transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Analyze,
    Plan,
    Implement,
    Verify,
    Complete,
    Failed,
    Escalated,
}

impl Phase {
    /// Ordinal used for "strictly forward" comparisons among non-terminal
    /// phases. Terminal phases are not ordered relative to each other.
    pub fn order(self) -> u8 {
        match self {
            Phase::Init => 0,
            Phase::Analyze => 1,
            Phase::Plan => 2,
            Phase::Implement => 3,
            Phase::Verify => 4,
            Phase::Complete => 5,
            Phase::Failed => 5,
            Phase::Escalated => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Escalated)
    }

    /// Per-phase step cap. Terminal phases have no cap.
    pub fn max_steps(self) -> Option<u32> {
        match self {
            Phase::Init => Some(2),
            Phase::Analyze => Some(5),
            Phase::Plan => Some(2),
            Phase::Implement => Some(15),
            Phase::Verify => Some(5),
            Phase::Complete | Phase::Failed | Phase::Escalated => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Analyze => "analyze",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Verify => "verify",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
            Phase::Escalated => "escalated",
        };
        write!(f, "{s}")
    }
}

/// A bounded-length history of past phases, most recent last.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PhaseHistory {
    entries: VecDeque<Phase>,
    cap: usize,
}

impl PhaseHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, phase: Phase) {
        if self.entries.len() >= self.cap.max(1) {
            self.entries.pop_front();
        }
        self.entries.push_back(phase);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Phase> {
        self.entries.iter()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseState {
    pub current_phase: Phase,
    pub steps_in_phase: u32,
    #[serde(default = "default_phase_history")]
    pub phase_history: PhaseHistory,
}

fn default_phase_history() -> PhaseHistory {
    PhaseHistory::new(32)
}

impl PhaseState {
    pub fn new() -> Self {
        Self {
            current_phase: Phase::Init,
            steps_in_phase: 0,
            phase_history: PhaseHistory::new(32),
        }
    }
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationState {
    pub checks_passing: u32,
    pub checks_failing: u32,
    pub tests_passing: bool,
    pub ready_for_completion: bool,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Category of a derived fact.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    CodeStructure,
    Verification,
    Inference,
    Pattern,
    Error,
}

/// Immutable, confidence-scored conclusion produced by the fact extractor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub category: FactCategory,
    pub statement: String,
    pub confidence: f64,
    pub source: String,
    pub step: u32,
    pub supersedes: Option<String>,
}

/// Outcome of a single tool invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    Partial,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub action: String,
    pub target: Option<String>,
    pub parameters: serde_json::Value,
    pub result: ActionOutcome,
    pub summary: String,
    pub facts_produced: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Declared shape of an action the model may take.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    pub description: String,
    pub parameters: Vec<(String, String)>,
    pub preconditions: Vec<String>,
    pub postconditions: Vec<String>,
    pub phases: Vec<Phase>,
    pub priority: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionSuggestion {
    pub start_line: usize,
    pub end_line: usize,
    pub tag: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViolatingFunction {
    pub name: String,
    pub source: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComplexityMetrics {
    pub cyclomatic_complexity: u32,
    pub line_count: usize,
    pub nesting_depth: u32,
}

/// Deterministic analysis produced once at task start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrecomputedContext {
    pub violating_function: ViolatingFunction,
    pub neighborhood: String,
    pub imports: Vec<String>,
    pub complexity_metrics: ComplexityMetrics,
    pub extraction_suggestions: Vec<ExtractionSuggestion>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub task_id: TaskId,
    pub violation_id: String,
    pub files_changed: Vec<String>,
    pub tests_passing: bool,
    pub checks_passing: bool,
    pub duration_ms: u64,
    pub steps: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub task_id: TaskId,
    pub reason: String,
    pub loop_detection: Option<serde_json::Value>,
    pub last_actions: Vec<ActionRecord>,
    pub active_facts: Vec<Fact>,
    pub diagnostic_bundle_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_monotonic_through_implement() {
        assert!(Phase::Init.order() < Phase::Analyze.order());
        assert!(Phase::Analyze.order() < Phase::Plan.order());
        assert!(Phase::Plan.order() < Phase::Implement.order());
        assert!(Phase::Implement.order() < Phase::Verify.order());
    }

    #[test]
    fn phase_history_drops_oldest_past_cap() {
        let mut h = PhaseHistory::new(2);
        h.push(Phase::Init);
        h.push(Phase::Analyze);
        h.push(Phase::Plan);
        let collected: Vec<_> = h.iter().copied().collect();
        assert_eq!(collected, vec![Phase::Analyze, Phase::Plan]);
    }

    #[test]
    fn max_steps_matches_spec_defaults() {
        assert_eq!(Phase::Init.max_steps(), Some(2));
        assert_eq!(Phase::Analyze.max_steps(), Some(5));
        assert_eq!(Phase::Plan.max_steps(), Some(2));
        assert_eq!(Phase::Implement.max_steps(), Some(15));
        assert_eq!(Phase::Verify.max_steps(), Some(5));
        assert_eq!(Phase::Complete.max_steps(), None);
    }
}
