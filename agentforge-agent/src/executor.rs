//! Executor: the per-step transactional algorithm that drives one task
//! from its current phase toward a terminal one.
//!
//! Each step opens its own [`agentforge_core::Txn`], so a crash between
//! steps leaves durable state exactly as of the last commit ("resume
//! after crash").

use crate::context::ContextBuilder;
use crate::driver::{parse_action_block, AgentResponse, LlmDriver};
use crate::error::WorkflowError;
use crate::tools::{ToolContext, ToolHandler, ToolRegistry};
use crate::transaction::StepSnapshot;
use agentforge_core::{
    phase, ActionDef, ActionOutcome, ActionRecord, Fact, FactCategory, Phase, PhaseContext, Task, TerminalRequest, Txn,
};
use agentforge_runtime::{AdaptiveBudget, LoopDetection, LoopDetector};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const MUTATING_ACTIONS: &[&str] =
    &["write_file", "edit_file", "replace_lines", "insert_lines", "extract_function", "simplify_conditional"];

/// One step's result, reported back to the Fix Workflow (C9).
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step: u32,
    pub action: String,
    pub result: ActionOutcome,
    pub phase: Phase,
    pub terminal: bool,
    pub loop_detection: Option<LoopDetection>,
}

pub struct Executor {
    project_root: PathBuf,
    system_prompt: String,
    registry: ToolRegistry,
    driver: Box<dyn LlmDriver>,
    context_builder: ContextBuilder,
    loop_detector: LoopDetector,
    actions_catalog: Vec<ActionDef>,
}

impl Executor {
    pub fn new(project_root: PathBuf, system_prompt: String, driver: Box<dyn LlmDriver>) -> Self {
        Self {
            project_root,
            system_prompt,
            registry: ToolRegistry::with_p0_handlers(),
            driver,
            context_builder: ContextBuilder::default(),
            loop_detector: LoopDetector::new(Default::default()),
            actions_catalog: action_catalog(),
        }
    }

    /// Runs one full step of the algorithm for `task_id` against `budget`,
    /// opening and committing exactly one transaction.
    pub async fn run_step(&self, task: &Task, task_id: &str, budget: &mut AdaptiveBudget) -> Result<StepOutcome, WorkflowError> {
        let started = Instant::now();
        let mut txn = Txn::begin(&self.project_root, task_id, LOCK_TIMEOUT)?;

        // 1/2: auto-transition check before doing any model work this step.
        let pre_ctx = phase_context(&txn, None);
        if let Some((to, reason)) = phase::should_auto_transition(&pre_ctx) {
            tracing::info!(task_id, from = %txn.phase().current_phase, %to, reason, "auto-transition");
            apply_transition(&mut txn, to);
            if to.is_terminal() {
                txn.commit()?;
                return Ok(StepOutcome {
                    step: txn_step(&txn),
                    action: "auto_transition".to_string(),
                    result: ActionOutcome::Success,
                    phase: to,
                    terminal: true,
                    loop_detection: None,
                });
            }
        }

        let step = txn_step(&txn) + 1;
        let precomputed = txn.precomputed().cloned().ok_or_else(|| WorkflowError::PrecomputeFailed("no precomputed context for task".to_string()))?;
        let active_facts = txn.facts().top_by_score(5);
        let recent: Vec<ActionRecord> = txn.actions().iter().rev().take(3).rev().cloned().collect();

        // 3: build context.
        let step_context = self
            .context_builder
            .build(task, txn.phase(), step, &active_facts, txn.verification(), &precomputed, &self.actions_catalog, &recent)?;
        let payload = serde_json::to_string_pretty(&step_context).unwrap_or_default();

        // 4/5: invoke the model, with a single retry on a malformed response.
        let response = self.invoke_with_retry(&payload).await?;

        // 6: look up the handler, or recognize a terminal request directly.
        if let Some(terminal) = terminal_request(&response.action) {
            txn.phase_mut().steps_in_phase += 1;
            let outcome = self.apply_terminal_request(&mut txn, terminal, step);
            txn.commit()?;
            return Ok(outcome);
        }

        let Some(handler) = self.registry.get(&response.action) else {
            let record = ActionRecord {
                step,
                action: response.action.clone(),
                target: None,
                parameters: response.parameters.clone(),
                result: ActionOutcome::Failure,
                summary: format!("unknown action '{}'", response.action),
                facts_produced: vec![],
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some("unknown action".to_string()),
            };
            txn.append_action(record);
            txn.phase_mut().steps_in_phase += 1;
            budget.record_step(false).ok();
            txn.commit()?;
            return Ok(StepOutcome {
                step,
                action: response.action,
                result: ActionOutcome::Failure,
                phase: txn.phase().current_phase,
                terminal: false,
                loop_detection: None,
            });
        };

        let tool_ctx = ToolContext {
            project_root: self.project_root.clone(),
            task_id: task_id.to_string(),
            violation_id: task.violation.id.clone(),
            files_examined: vec![],
            phase: txn.phase().current_phase,
            conformance_check_id: task.violation.check_id.clone(),
            test_path: task.violation.test_path.clone(),
        };

        // 7: snapshot every file a mutating handler might touch.
        let mut snapshot = StepSnapshot::new();
        let target = response.parameters.get("path").and_then(|v| v.as_str()).map(|s| s.to_string());
        if handler.is_mutating() {
            if let Some(ref rel) = target {
                snapshot.snapshot(&self.project_root.join(rel));
            }
        }
        let tests_passing_before = txn.verification().tests_passing;

        // 8: execute.
        let result_text = handler.invoke(&response.parameters, &tool_ctx);
        let mut result = classify(&result_text);

        // auto-revert on regression: a mutating step that flips passing
        // tests to failing is reverted in place.
        if handler.is_mutating() && result == ActionOutcome::Success && tests_passing_before {
            if let Some(regressed) = self.detect_regression(&tool_ctx) {
                if regressed {
                    snapshot.restore().map_err(|e| WorkflowError::Tool(crate::error::ToolError::Io(std::io::Error::other(e))))?;
                    result = ActionOutcome::Partial;
                }
            }
        }

        // 10: extract facts from the result text.
        let new_facts = facts_from_result(&response.action, &result_text, step);
        let mut fact_ids = Vec::new();
        for fact in new_facts {
            fact_ids.push(fact.id.clone());
            txn.facts_mut().add(fact).ok();
        }

        if response.action == "run_check" || response.action == "run_tests" {
            update_verification(&mut txn, &response.action, &result_text);
        }

        // 11: append the action record.
        let record = ActionRecord {
            step,
            action: response.action.clone(),
            target,
            parameters: response.parameters.clone(),
            result,
            summary: result_text.chars().take(200).collect(),
            facts_produced: fact_ids,
            duration_ms: started.elapsed().as_millis() as u64,
            error: if result == ActionOutcome::Failure { Some(result_text.clone()) } else { None },
        };
        txn.append_action(record);

        // 12: persist the raw step output.
        txn.write_output(step, serde_yaml::to_value(&step_context).unwrap_or(serde_yaml::Value::Null));

        // 13: loop detector over the updated history.
        let loop_hit = self.loop_detector.detect(txn.actions());

        // 14: advance the phase.
        txn.phase_mut().steps_in_phase += 1;
        budget.record_step(matches!(result, ActionOutcome::Success)).ok();

        let files_modified = handler.is_mutating() && result == ActionOutcome::Success;
        let post_ctx = phase_context(&txn, None);
        let post_ctx = PhaseContext { files_modified: post_ctx.files_modified || files_modified, ..post_ctx };
        let final_phase = if let Some(hit) = &loop_hit {
            tracing::warn!(task_id, kind = ?hit.kind, hit.description, "loop detected, forcing escalation");
            apply_transition(&mut txn, Phase::Escalated);
            Phase::Escalated
        } else if let Some((to, reason)) = phase::should_auto_transition(&post_ctx) {
            tracing::info!(task_id, to = %to, reason, "post-step auto-transition");
            apply_transition(&mut txn, to);
            to
        } else {
            txn.phase().current_phase
        };

        // 15: commit.
        txn.commit()?;
        Ok(StepOutcome { step, action: response.action, result, phase: final_phase, terminal: final_phase.is_terminal(), loop_detection: loop_hit })
    }

    async fn invoke_with_retry(&self, payload: &str) -> Result<AgentResponse, WorkflowError> {
        let raw = self.driver.invoke(&self.system_prompt, payload).await?;
        match parse_action_block(&raw) {
            Ok(response) => Ok(response),
            Err(_) => {
                let retry_prompt = format!(
                    "{payload}\n\nYour previous response did not contain a well-formed ```action``` block. \
                     Respond again with exactly one fenced action block."
                );
                let raw_retry = self.driver.invoke(&self.system_prompt, &retry_prompt).await?;
                Ok(parse_action_block(&raw_retry)?)
            }
        }
    }

    fn apply_terminal_request(&self, txn: &mut Txn, terminal: TerminalRequest, step: u32) -> StepOutcome {
        let ctx = PhaseContext { last_action_was_terminal_request: Some(terminal), ..phase_context(txn, None) };
        let to = phase::should_auto_transition(&ctx).map(|(p, _)| p).unwrap_or(match terminal {
            TerminalRequest::Complete => Phase::Complete,
            _ => Phase::Escalated,
        });
        apply_transition(txn, to);
        let record = ActionRecord {
            step,
            action: terminal_action_name(terminal).to_string(),
            target: None,
            parameters: serde_json::Value::Null,
            result: ActionOutcome::Success,
            summary: format!("terminal request: {to}"),
            facts_produced: vec![],
            duration_ms: 0,
            error: None,
        };
        txn.append_action(record);
        StepOutcome {
            step,
            action: terminal_action_name(terminal).to_string(),
            result: ActionOutcome::Success,
            phase: to,
            terminal: to.is_terminal(),
            loop_detection: None,
        }
    }

    /// Re-runs the task's test command and compares against the
    /// pre-step state to decide whether a mutating step regressed it.
    /// Returns `None` when there is no known test path to check.
    fn detect_regression(&self, ctx: &ToolContext) -> Option<bool> {
        let test_path = ctx.test_path.as_ref()?;
        let handler = crate::tools::RunTestsHandler;
        let result = handler.invoke(&serde_json::json!({ "path": test_path }), ctx);
        Some(result.starts_with("ERROR") || result.to_lowercase().contains(" failed") && !result.contains("0 failed"))
    }
}

fn terminal_request(action: &str) -> Option<TerminalRequest> {
    match action {
        "complete" => Some(TerminalRequest::Complete),
        "escalate" => Some(TerminalRequest::Escalate),
        "cannot_fix" => Some(TerminalRequest::CannotFix),
        _ => None,
    }
}

fn terminal_action_name(terminal: TerminalRequest) -> &'static str {
    match terminal {
        TerminalRequest::Complete => "complete",
        TerminalRequest::Escalate => "escalate",
        TerminalRequest::CannotFix => "cannot_fix",
    }
}

fn txn_step(txn: &Txn) -> u32 {
    txn.actions().last().map(|a| a.step).unwrap_or(0)
}

fn phase_context(txn: &Txn, last_terminal: Option<TerminalRequest>) -> PhaseContext {
    let has_code_structure_facts = !txn.facts().get_by_category(FactCategory::CodeStructure).is_empty();
    let last = txn.actions().last();
    PhaseContext {
        current_phase: txn.phase().current_phase,
        steps_in_phase: txn.phase().steps_in_phase,
        has_code_structure_facts,
        files_modified: last.map(|a| MUTATING_ACTIONS.contains(&a.action.as_str()) && a.result == ActionOutcome::Success).unwrap_or(false),
        verification_failing: txn.verification().checks_failing > 0,
        verification_passing: txn.verification().checks_failing == 0 && txn.verification().checks_passing > 0,
        tests_passing: txn.verification().tests_passing,
        last_action_result: last.map(|a| a.result),
        last_action_was_terminal_request: last_terminal,
    }
}

fn apply_transition(txn: &mut Txn, to: Phase) {
    let history_cap_phase = txn.phase().current_phase;
    txn.phase_mut().phase_history.push(history_cap_phase);
    txn.phase_mut().current_phase = to;
    txn.phase_mut().steps_in_phase = 0;
}

fn classify(result_text: &str) -> ActionOutcome {
    if result_text.starts_with("SUCCESS:") {
        ActionOutcome::Success
    } else if result_text.starts_with("ERROR:") {
        ActionOutcome::Failure
    } else {
        ActionOutcome::Skipped
    }
}

/// Understanding Extractor: a two-tier rule-based ruleset per tool family.
/// The first rule whose pattern matches the result text wins, fixing both
/// the fact's category and confidence; a generic `SUCCESS:`/`ERROR:` rule
/// at 0.7 confidence catches anything no specific rule recognizes.
fn facts_from_result(action: &str, result_text: &str, step: u32) -> Vec<Fact> {
    let (statement, category, confidence) = match action {
        "run_check" if result_text.contains("Check PASSED") => {
            (format!("{action}: check passed"), FactCategory::Verification, 1.0)
        }
        "run_check" if result_text.contains("Violations (") => {
            (format!("{action}: {}", result_text.trim()), FactCategory::Verification, 1.0)
        }
        _ if result_text.contains("Function '") && result_text.contains("has ") => {
            (format!("{action}: {}", result_text.trim()), FactCategory::Verification, 1.0)
        }
        "edit_file" if result_text.contains("old_text not found") => {
            (format!("{action} failed: old_text not found"), FactCategory::Error, 1.0)
        }
        _ if result_text.to_lowercase().contains("control flow") => {
            (format!("{action} failed: crosses control flow"), FactCategory::Error, 0.95)
        }
        _ => {
            if let Some(rest) = result_text.strip_prefix("SUCCESS:") {
                let category = match action {
                    "run_check" | "run_tests" => FactCategory::Verification,
                    "read_file" | "search_code" | "load_context" => FactCategory::CodeStructure,
                    "write_file" | "edit_file" | "replace_lines" | "insert_lines" | "extract_function"
                    | "simplify_conditional" => FactCategory::Pattern,
                    _ => FactCategory::Inference,
                };
                (format!("{action}: {}", rest.trim()), category, 0.7)
            } else if let Some(rest) = result_text.strip_prefix("ERROR:") {
                (format!("{action} failed: {}", rest.trim()), FactCategory::Error, 0.7)
            } else {
                return vec![];
            }
        }
    };

    vec![Fact {
        id: format!("step{step}-{action}"),
        category,
        statement,
        confidence,
        source: action.to_string(),
        step,
        supersedes: None,
    }]
}

fn update_verification(txn: &mut Txn, action: &str, result_text: &str) {
    let now = chrono::Utc::now();
    if action == "run_check" {
        if result_text.contains("Check PASSED") {
            txn.verification_mut().checks_passing = 1;
            txn.verification_mut().checks_failing = 0;
        } else if let Some(n) = extract_count(result_text, "Violations (") {
            txn.verification_mut().checks_passing = 0;
            txn.verification_mut().checks_failing = n;
        }
    } else if action == "run_tests" {
        let failed = extract_count_before(result_text, " failed").unwrap_or(0);
        txn.verification_mut().tests_passing = failed == 0;
    }
    txn.verification_mut().last_check_time = Some(now);
    txn.verification_mut().ready_for_completion = txn.verification().checks_failing == 0 && txn.verification().tests_passing;
}

fn extract_count(text: &str, prefix: &str) -> Option<u32> {
    let idx = text.find(prefix)?;
    text[idx + prefix.len()..].chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok()
}

/// Reads the run of digits immediately preceding `suffix`, e.g. the `1` in
/// `"1 failed, 1 passed"` for `suffix=" failed"`.
fn extract_count_before(text: &str, suffix: &str) -> Option<u32> {
    let idx = text.find(suffix)?;
    let digits: String = text[..idx].chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

/// The P0 action catalog the context builder advertises to the model:
/// which phases each action is legal in, and a priority used only to pick
/// the `recommended` hint.
pub fn action_catalog() -> Vec<ActionDef> {
    use Phase::*;
    vec![
        action_def("read_file", "Read a file's contents.", &[Init, Analyze, Plan, Implement, Verify], 1),
        action_def("search_code", "Regex search over project files.", &[Init, Analyze], 2),
        action_def("load_context", "Load precomputed analysis for the task.", &[Init, Analyze], 3),
        action_def("write_file", "Overwrite a file's contents.", &[Implement], 5),
        action_def("edit_file", "Replace the first match of old_text with new_text.", &[Implement], 6),
        action_def("replace_lines", "Replace a line range.", &[Implement], 5),
        action_def("insert_lines", "Insert lines at an offset.", &[Implement], 4),
        action_def("extract_function", "Extract a line range into a new function.", &[Implement], 7),
        action_def("simplify_conditional", "Flip an if/else-return into a guard clause.", &[Implement], 7),
        action_def("run_check", "Re-run the conformance check.", &[Analyze, Verify], 8),
        action_def("run_tests", "Run the test suite.", &[Verify], 8),
        action_def("complete", "Declare the task done.", &[Verify], 9),
        action_def("escalate", "Hand the task to a human.", &[Init, Analyze, Plan, Implement, Verify], 0),
        action_def("cannot_fix", "Declare the violation unfixable.", &[Analyze, Implement], 0),
    ]
}

fn action_def(name: &str, description: &str, phases: &[Phase], priority: i32) -> ActionDef {
    ActionDef {
        name: name.to_string(),
        description: description.to_string(),
        parameters: vec![],
        preconditions: vec![],
        postconditions: vec![],
        phases: phases.to_vec(),
        priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success_and_error_envelopes() {
        assert_eq!(classify("SUCCESS: ok"), ActionOutcome::Success);
        assert_eq!(classify("ERROR: nope"), ActionOutcome::Failure);
    }

    #[test]
    fn facts_from_result_tags_verification_category() {
        let facts = facts_from_result("run_check", "SUCCESS: Check PASSED", 1);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, FactCategory::Verification);
    }

    #[test]
    fn facts_from_result_tags_known_error_pattern_at_full_confidence() {
        let facts = facts_from_result("edit_file", "ERROR: old_text not found in a.py", 2);
        assert_eq!(facts[0].category, FactCategory::Error);
        assert_eq!(facts[0].confidence, 1.0);
    }

    #[test]
    fn facts_from_result_falls_back_to_generic_rule_at_lower_confidence() {
        let facts = facts_from_result("edit_file", "ERROR: disk full", 2);
        assert_eq!(facts[0].category, FactCategory::Error);
        assert_eq!(facts[0].confidence, 0.7);
    }

    #[test]
    fn facts_from_result_tags_complexity_report_at_full_confidence() {
        let facts = facts_from_result("run_check", "SUCCESS: Function 'f' has complexity 12", 3);
        assert_eq!(facts[0].confidence, 1.0);
    }

    #[test]
    fn action_catalog_covers_p0_handlers() {
        let catalog = action_catalog();
        assert!(catalog.iter().any(|a| a.name == "run_tests"));
        assert!(catalog.iter().any(|a| a.name == "simplify_conditional"));
    }
}
