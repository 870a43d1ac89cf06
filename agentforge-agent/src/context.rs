//! Context Builder: assembles the bounded, per-step payload handed to the
//! model.
//!
//! Produces one [`StepContext`] per step. Field declaration order is the
//! serialized section order; compaction trims sections in a fixed order
//! rather than shrinking everything proportionally.

use crate::error::ContextError;
use agentforge_core::{
    ActionDef, ActionRecord, Fact, FactCategory, Phase, PhaseState, PrecomputedContext, Task, VerificationState,
};
use serde::Serialize;
use std::collections::BTreeMap;

const DEFAULT_TOKEN_BUDGET: usize = 5_000;
const SOURCE_EXCERPT_HEAD_LINES: usize = 60;
const RECENT_ACTIONS_LIMIT: usize = 3;
const TOP_FACTS_LIMIT: usize = 5;

#[derive(Clone, Debug, Serialize)]
pub struct TaskSection {
    pub id: String,
    pub goal: String,
    pub step: u32,
    pub current_phase: Phase,
    pub success_criteria: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RenderedFact {
    pub rendered: String,
    pub category: FactCategory,
}

#[derive(Clone, Debug, Serialize, Default)]
pub struct UnderstandingSection {
    pub by_category: BTreeMap<String, Vec<RenderedFact>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerificationSection {
    pub passing: u32,
    pub failing: u32,
    pub tests_ok: bool,
    pub ready: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ViolationContext {
    pub violation_id: String,
    pub check_id: String,
    pub severity: String,
    pub file_path: String,
    pub line_number: Option<usize>,
    pub message: String,
    pub fix_hint: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisSection {
    pub violating_function_name: String,
    pub source_excerpt: String,
    pub truncated: bool,
    pub extraction_suggestions: Vec<String>,
    pub complexity: agentforge_core::ComplexityMetrics,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionsSection {
    pub available: Vec<ActionDef>,
    pub recommended: Option<String>,
    pub blocked: Vec<(String, String)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RecentActionSummary {
    pub step: u32,
    pub action: String,
    pub result: String,
    pub summary: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepContext {
    pub task: TaskSection,
    pub understanding: UnderstandingSection,
    pub verification: VerificationSection,
    pub context: ViolationContext,
    pub analysis: AnalysisSection,
    pub actions: ActionsSection,
    pub recent: Vec<RecentActionSummary>,
}

pub struct ContextBuilder {
    token_budget: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self { token_budget: DEFAULT_TOKEN_BUDGET }
    }
}

impl ContextBuilder {
    pub fn with_token_budget(token_budget: usize) -> Self {
        Self { token_budget }
    }

    /// Builds and validates a `StepContext`. Applies the fixed compaction
    /// order (facts, then source excerpt, then analysis detail) until the
    /// approximate token count fits the budget, or schema validation fails
    /// (`ContextError::Invalid`), which is always fatal.
    pub fn build(
        &self,
        task: &Task,
        phase: &PhaseState,
        step: u32,
        active_facts: &[&Fact],
        verification: &VerificationState,
        precomputed: &PrecomputedContext,
        actions: &[ActionDef],
        recent: &[ActionRecord],
    ) -> Result<StepContext, ContextError> {
        let mut top_facts: Vec<&Fact> = active_facts.to_vec();
        top_facts.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

        let mut source_excerpt = precomputed.violating_function.source.clone();
        let mut truncated = false;

        let mut ctx = self.assemble(task, phase, step, &top_facts, verification, precomputed, actions, recent, &source_excerpt, truncated)?;

        // Compaction step 1: drop facts beyond the top TOP_FACTS_LIMIT by confidence.
        if self.approx_tokens(&ctx) > self.token_budget && top_facts.len() > TOP_FACTS_LIMIT {
            top_facts.truncate(TOP_FACTS_LIMIT);
            ctx = self.assemble(task, phase, step, &top_facts, verification, precomputed, actions, recent, &source_excerpt, truncated)?;
        }

        // Compaction step 2: truncate the source excerpt to the head N lines.
        if self.approx_tokens(&ctx) > self.token_budget {
            let lines: Vec<&str> = source_excerpt.lines().collect();
            if lines.len() > SOURCE_EXCERPT_HEAD_LINES {
                source_excerpt = lines[..SOURCE_EXCERPT_HEAD_LINES].join("\n");
                truncated = true;
                ctx = self.assemble(task, phase, step, &top_facts, verification, precomputed, actions, recent, &source_excerpt, truncated)?;
            }
        }

        // Compaction step 3: truncate remaining analysis detail fields (extraction suggestions).
        if self.approx_tokens(&ctx) > self.token_budget && ctx.analysis.extraction_suggestions.len() > 1 {
            ctx.analysis.extraction_suggestions.truncate(1);
        }

        self.validate(&ctx)?;
        Ok(ctx)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        task: &Task,
        phase: &PhaseState,
        step: u32,
        top_facts: &[&Fact],
        verification: &VerificationState,
        precomputed: &PrecomputedContext,
        actions: &[ActionDef],
        recent: &[ActionRecord],
        source_excerpt: &str,
        truncated: bool,
    ) -> Result<StepContext, ContextError> {
        let mut by_category: BTreeMap<String, Vec<RenderedFact>> = BTreeMap::new();
        for fact in top_facts {
            by_category.entry(category_key(fact.category)).or_default().push(RenderedFact {
                rendered: format!("{} (conf: {:.1})", fact.statement, fact.confidence),
                category: fact.category,
            });
        }

        let available: Vec<ActionDef> = actions
            .iter()
            .filter(|a| a.phases.contains(&phase.current_phase))
            .cloned()
            .collect();
        let mut sorted = available.clone();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        let recommended = sorted.first().map(|a| a.name.clone());
        let blocked: Vec<(String, String)> = actions
            .iter()
            .filter(|a| !a.phases.contains(&phase.current_phase))
            .map(|a| (a.name.clone(), format!("not legal in phase {}", phase.current_phase)))
            .collect();

        let recent_summaries: Vec<RecentActionSummary> = recent
            .iter()
            .rev()
            .take(RECENT_ACTIONS_LIMIT)
            .map(|a| RecentActionSummary {
                step: a.step,
                action: a.action.clone(),
                result: format!("{:?}", a.result),
                summary: a.summary.clone(),
            })
            .rev()
            .collect();

        Ok(StepContext {
            task: TaskSection {
                id: task.task_id.to_string(),
                goal: task.goal.clone(),
                step,
                current_phase: phase.current_phase,
                success_criteria: task.success_criteria.clone(),
            },
            understanding: UnderstandingSection { by_category },
            verification: VerificationSection {
                passing: verification.checks_passing,
                failing: verification.checks_failing,
                tests_ok: verification.tests_passing,
                ready: verification.ready_for_completion,
            },
            context: ViolationContext {
                violation_id: task.violation.id.clone(),
                check_id: task.violation.check_id.clone(),
                severity: task.violation.severity.clone(),
                file_path: task.violation.file_path.clone(),
                line_number: task.violation.line_number,
                message: task.violation.message.clone(),
                fix_hint: task.violation.fix_hint.clone(),
            },
            analysis: AnalysisSection {
                violating_function_name: precomputed.violating_function.name.clone(),
                source_excerpt: source_excerpt.to_string(),
                truncated,
                extraction_suggestions: precomputed
                    .extraction_suggestions
                    .iter()
                    .map(|s| format!("{}..{} ({})", s.start_line, s.end_line, s.tag))
                    .collect(),
                complexity: precomputed.complexity_metrics.clone(),
            },
            actions: ActionsSection { available: sorted, recommended, blocked },
            recent: recent_summaries,
        })
    }

    fn approx_tokens(&self, ctx: &StepContext) -> usize {
        let serialized = serde_json::to_string(ctx).unwrap_or_default();
        serialized.len() / 4
    }

    fn validate(&self, ctx: &StepContext) -> Result<(), ContextError> {
        if ctx.task.id.is_empty() {
            return Err(ContextError::Invalid("task.id is empty".to_string()));
        }
        if ctx.task.goal.is_empty() {
            return Err(ContextError::Invalid("task.goal is empty".to_string()));
        }
        if ctx.context.violation_id.is_empty() {
            return Err(ContextError::Invalid("context.violation_id is empty".to_string()));
        }
        if ctx.analysis.violating_function_name.is_empty() {
            return Err(ContextError::Invalid("analysis.violating_function_name is empty".to_string()));
        }
        if ctx.actions.available.is_empty() {
            return Err(ContextError::Invalid("no actions available in the current phase".to_string()));
        }
        Ok(())
    }
}

fn category_key(category: FactCategory) -> String {
    match category {
        FactCategory::CodeStructure => "code_structure",
        FactCategory::Verification => "verification",
        FactCategory::Inference => "inference",
        FactCategory::Pattern => "pattern",
        FactCategory::Error => "error",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentforge_core::{ComplexityMetrics, ExtractionSuggestion, Task, TaskId, ViolatingFunction, Violation};
    use chrono::Utc;

    fn sample_task() -> Task {
        Task::new_fix_violation(
            TaskId::new("t1"),
            Violation {
                id: "v1".into(),
                check_id: "complexity".into(),
                severity: "error".into(),
                file_path: "src/foo.rs".into(),
                line_number: Some(10),
                message: "too complex".into(),
                fix_hint: None,
                test_path: None,
            },
            Utc::now(),
        )
    }

    fn sample_precomputed() -> PrecomputedContext {
        PrecomputedContext {
            violating_function: ViolatingFunction {
                name: "foo".into(),
                source: (0..100).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n"),
                start_line: 1,
                end_line: 100,
            },
            neighborhood: String::new(),
            imports: vec![],
            complexity_metrics: ComplexityMetrics { cyclomatic_complexity: 20, line_count: 100, nesting_depth: 5 },
            extraction_suggestions: vec![
                ExtractionSuggestion { start_line: 5, end_line: 10, tag: "guard".into() },
                ExtractionSuggestion { start_line: 20, end_line: 30, tag: "body".into() },
            ],
        }
    }

    fn sample_actions() -> Vec<ActionDef> {
        vec![ActionDef {
            name: "escalate".into(),
            description: "Hand the task to a human.".into(),
            parameters: vec![],
            preconditions: vec![],
            postconditions: vec![],
            phases: vec![Phase::Init, Phase::Analyze, Phase::Plan, Phase::Implement, Phase::Verify],
            priority: 0,
        }]
    }

    #[test]
    fn build_succeeds_with_minimal_inputs() {
        let builder = ContextBuilder::default();
        let task = sample_task();
        let phase = PhaseState::new();
        let verification = VerificationState::default();
        let precomputed = sample_precomputed();
        let actions = sample_actions();
        let ctx = builder
            .build(&task, &phase, 1, &[], &verification, &precomputed, &actions, &[])
            .unwrap();
        assert_eq!(ctx.task.id, "t1");
    }

    #[test]
    fn tight_budget_truncates_source_excerpt() {
        let builder = ContextBuilder::with_token_budget(50);
        let task = sample_task();
        let phase = PhaseState::new();
        let verification = VerificationState::default();
        let precomputed = sample_precomputed();
        let actions = sample_actions();
        let ctx = builder
            .build(&task, &phase, 1, &[], &verification, &precomputed, &actions, &[])
            .unwrap();
        assert!(ctx.analysis.truncated);
    }

    #[test]
    fn build_fails_when_no_actions_are_legal_in_the_current_phase() {
        let builder = ContextBuilder::default();
        let task = sample_task();
        let phase = PhaseState::new();
        let verification = VerificationState::default();
        let precomputed = sample_precomputed();
        let err = builder
            .build(&task, &phase, 1, &[], &verification, &precomputed, &[], &[])
            .unwrap_err();
        assert!(matches!(err, ContextError::Invalid(_)));
    }
}
