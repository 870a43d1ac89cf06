//! Phase Machine: a guarded state graph over the task's lifecycle, driving
//! the per-step auto-transition decision.
//!
//! Transitions are encoded as a small table of `(from, to, guard)` entries,
//! evaluated against a read-only [`PhaseContext`] snapshot. No callbacks fire
//! on transition; the executor performs side effects around the call.

use crate::error::PhaseError;
use crate::types::{ActionOutcome, Phase};

/// Read-only view the guards evaluate against. Built fresh by the caller
/// from task state each time a transition decision is needed.
#[derive(Clone, Debug)]
pub struct PhaseContext {
    pub current_phase: Phase,
    pub steps_in_phase: u32,
    pub has_code_structure_facts: bool,
    pub files_modified: bool,
    pub verification_failing: bool,
    pub verification_passing: bool,
    pub tests_passing: bool,
    pub last_action_result: Option<ActionOutcome>,
    pub last_action_was_terminal_request: Option<TerminalRequest>,
}

/// The model explicitly asked to stop, distinguishing `complete` requests
/// from `escalate`/`cannot_fix` requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminalRequest {
    Complete,
    Escalate,
    CannotFix,
}

type Guard = fn(&PhaseContext) -> bool;

struct Edge {
    from: Phase,
    to: Phase,
    guard: Guard,
    description: &'static str,
}

fn always(_: &PhaseContext) -> bool {
    true
}

fn edges() -> Vec<Edge> {
    vec![
        Edge { from: Phase::Init, to: Phase::Analyze, guard: always, description: "init -> analyze: none" },
        Edge {
            from: Phase::Init,
            to: Phase::Implement,
            guard: |c| c.has_code_structure_facts,
            description: "init -> implement: precomputed has code-structure facts",
        },
        Edge {
            from: Phase::Analyze,
            to: Phase::Plan,
            guard: |c| c.steps_in_phase >= 1 && c.has_code_structure_facts,
            description: "analyze -> plan: >=1 step in phase and code-structure facts present",
        },
        Edge {
            from: Phase::Analyze,
            to: Phase::Implement,
            guard: |c| c.has_code_structure_facts,
            description: "analyze -> implement: code-structure facts present",
        },
        Edge { from: Phase::Plan, to: Phase::Implement, guard: always, description: "plan -> implement: none" },
        Edge {
            from: Phase::Implement,
            to: Phase::Verify,
            guard: |c| c.files_modified,
            description: "implement -> verify: files_modified != empty",
        },
        Edge {
            from: Phase::Verify,
            to: Phase::Implement,
            guard: |c| c.verification_failing,
            description: "verify -> implement: verification failing",
        },
        Edge {
            from: Phase::Verify,
            to: Phase::Complete,
            guard: |c| c.verification_passing && c.tests_passing,
            description: "verify -> complete: verification passing and tests passing",
        },
    ]
}

/// Returns true if at least one registered `from -> to` edge's guard holds
/// on `ctx`.
pub fn can_transition(from: Phase, to: Phase, ctx: &PhaseContext) -> bool {
    edges().into_iter().any(|e| e.from == from && e.to == to && (e.guard)(ctx))
}

/// Global rules that apply from any non-terminal phase: a fatal action
/// result forces `failed`; an escalate/cannot_fix request forces
/// `escalated`.
fn global_override(ctx: &PhaseContext) -> Option<Phase> {
    if ctx.current_phase.is_terminal() {
        return None;
    }
    match ctx.last_action_was_terminal_request {
        Some(TerminalRequest::Escalate) | Some(TerminalRequest::CannotFix) => Some(Phase::Escalated),
        Some(TerminalRequest::Complete) if ctx.current_phase == Phase::Verify && ctx.verification_passing && ctx.tests_passing => {
            Some(Phase::Complete)
        }
        _ => None,
    }
}

/// Decides whether, and to what, an auto-transition should fire this step.
/// Prefers strictly-forward transitions in phase order to avoid oscillation.
pub fn should_auto_transition(ctx: &PhaseContext) -> Option<(Phase, &'static str)> {
    if let Some(forced) = global_override(ctx) {
        return Some((forced, "global override: fatal or escalate/cannot_fix/complete request"));
    }

    if ctx.current_phase.is_terminal() {
        return None;
    }

    // Forced transition on phase-cap overrun takes priority.
    if let Some(max) = ctx.current_phase.max_steps() {
        if ctx.steps_in_phase >= max {
            if let Some(forward) = first_legal_forward(ctx) {
                return Some((forward, "phase cap exceeded: forced forward transition"));
            }
            return Some((Phase::Escalated, "phase cap exceeded: no legal forward transition"));
        }
    }

    // implement-phase failure condition: >=12 steps with no files modified
    // forces `failed`.
    if ctx.current_phase == Phase::Implement && ctx.steps_in_phase >= 12 && !ctx.files_modified {
        return Some((Phase::Failed, "implement failure_condition: no modifications after 12 steps"));
    }

    first_legal_forward(ctx).map(|p| (p, "strictly-forward transition available"))
}

fn first_legal_forward(ctx: &PhaseContext) -> Option<Phase> {
    let mut candidates: Vec<Phase> = edges()
        .into_iter()
        .filter(|e| e.from == ctx.current_phase && (e.guard)(ctx))
        .map(|e| e.to)
        .collect();
    candidates.sort_by_key(|p| p.order());
    candidates
        .into_iter()
        .find(|to| to.order() >= ctx.current_phase.order())
}

/// Validates an explicit transition request the executor wants to apply,
/// returning the description of the satisfied edge or an error.
pub fn validate_transition(from: Phase, to: Phase, ctx: &PhaseContext) -> Result<&'static str, PhaseError> {
    let edge = edges().into_iter().find(|e| e.from == from && e.to == to);
    match edge {
        Some(e) if (e.guard)(&ctx) => Ok(e.description),
        Some(_) => Err(PhaseError::NoLegalTransition { from: from.to_string() }),
        None => Err(PhaseError::UnregisteredTransition { from: from.to_string(), to: to.to_string() }),
    }
}
