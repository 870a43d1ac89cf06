//! Loop Detector: flags a task that is repeating itself without progress.
//!
//! Detection runs in a fixed priority order — identical-action, then
//! error-cycle, then semantic-loop, then no-progress — and returns on the
//! first match, since an identical-action loop is also technically a
//! no-progress run and we want the more specific diagnosis reported.

use agentforge_core::{ActionOutcome, ActionRecord};
use serde::Serialize;
use std::collections::HashMap;

const MUTATING_ACTIONS: &[&str] = &[
    "write_file",
    "edit_file",
    "replace_lines",
    "insert_lines",
    "extract_function",
    "simplify_conditional",
];

#[derive(Clone, Copy, Debug)]
pub struct LoopThresholds {
    pub identical_threshold: usize,
    pub cycle_threshold: usize,
    pub semantic_threshold: usize,
    pub no_progress_threshold: usize,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            identical_threshold: 3,
            cycle_threshold: 2,
            semantic_threshold: 4,
            no_progress_threshold: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    IdenticalAction,
    ErrorCycle,
    SemanticLoop,
    NoProgress,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoopDetection {
    pub kind: LoopKind,
    pub confidence: f64,
    pub description: String,
    pub suggestions: Vec<String>,
    pub evidence: Vec<String>,
}

pub struct LoopDetector {
    thresholds: LoopThresholds,
}

impl LoopDetector {
    pub fn new(thresholds: LoopThresholds) -> Self {
        Self { thresholds }
    }

    /// Evaluates `history` (most recent action last) against all four
    /// detectors in priority order, returning the first hit.
    pub fn detect(&self, history: &[ActionRecord]) -> Option<LoopDetection> {
        self.detect_identical_action(history)
            .or_else(|| self.detect_error_cycle(history))
            .or_else(|| self.detect_semantic_loop(history))
            .or_else(|| self.detect_no_progress(history))
    }

    /// Same action name, all failing, same parameters or identical error.
    fn detect_identical_action(&self, history: &[ActionRecord]) -> Option<LoopDetection> {
        let n = self.thresholds.identical_threshold;
        if history.len() < n {
            return None;
        }
        let tail = &history[history.len() - n..];
        if !tail.iter().all(|a| a.result == ActionOutcome::Failure) {
            return None;
        }
        let first_sig = signature(&tail[0]);
        if tail.iter().all(|a| signature(a) == first_sig) {
            return Some(LoopDetection {
                kind: LoopKind::IdenticalAction,
                confidence: 0.95,
                description: format!(
                    "last {n} actions were identical and all failing: action={} target={:?}",
                    tail[0].action, tail[0].target
                ),
                suggestions: breakout_suggestions(&tail[0].action, tail[0].error.as_deref()),
                evidence: tail.iter().map(action_evidence).collect(),
            });
        }
        None
    }

    fn detect_error_cycle(&self, history: &[ActionRecord]) -> Option<LoopDetection> {
        let period = 2;
        let window = period * self.thresholds.cycle_threshold;
        if history.len() < window {
            return None;
        }
        let tail = &history[history.len() - window..];
        if !tail.iter().all(|a| a.result == ActionOutcome::Failure) {
            return None;
        }
        let a_sig = signature(&tail[0]);
        let b_sig = signature(&tail[1]);
        if a_sig == b_sig {
            return None; // that's identical-action, already handled above.
        }
        let cycles = tail.chunks(period).all(|pair| {
            pair.len() == period && signature(&pair[0]) == a_sig && signature(&pair[1]) == b_sig
        });
        if cycles {
            return Some(LoopDetection {
                kind: LoopKind::ErrorCycle,
                confidence: 0.9,
                description: format!(
                    "last {window} actions alternate between two failing actions: {} <-> {}",
                    tail[0].action, tail[1].action
                ),
                suggestions: vec![
                    "break the alternation: try a different action than either of the two in the cycle".to_string(),
                    "re-read the active facts before repeating the fix".to_string(),
                ],
                evidence: tail.iter().map(action_evidence).collect(),
            });
        }
        None
    }

    /// Mixed action names but identical error category, or identical error
    /// fact statements repeated at or above the semantic threshold.
    fn detect_semantic_loop(&self, history: &[ActionRecord]) -> Option<LoopDetection> {
        let n = self.thresholds.semantic_threshold;
        if history.len() < n {
            return None;
        }
        let tail = &history[history.len() - n..];

        let mixed_names = tail.windows(2).any(|w| w[0].action != w[1].action);
        if !mixed_names {
            return None; // uniform names belong to identical-action/error-cycle.
        }

        let errors: Vec<&str> = tail.iter().filter_map(|a| a.error.as_deref()).collect();
        if errors.len() == tail.len() {
            let first_category = error_category(errors[0]);
            if errors.iter().all(|e| error_category(e) == first_category) {
                return Some(LoopDetection {
                    kind: LoopKind::SemanticLoop,
                    confidence: 0.85,
                    description: format!(
                        "last {n} actions used mixed names ({}) but all failed with the same error category: {first_category}",
                        tail.iter().map(|a| a.action.as_str()).collect::<Vec<_>>().join(", ")
                    ),
                    suggestions: category_suggestions(first_category),
                    evidence: tail.iter().map(action_evidence).collect(),
                });
            }
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for e in &errors {
            *counts.entry(*e).or_insert(0) += 1;
        }
        if let Some((statement, count)) = counts.into_iter().max_by_key(|(_, c)| *c) {
            if count >= 3 {
                return Some(LoopDetection {
                    kind: LoopKind::SemanticLoop,
                    confidence: 0.85,
                    description: format!(
                        "the same error fact recurred {count} times across mixed actions: {statement}"
                    ),
                    suggestions: category_suggestions(error_category(statement)),
                    evidence: tail.iter().map(action_evidence).collect(),
                });
            }
        }
        None
    }

    fn detect_no_progress(&self, history: &[ActionRecord]) -> Option<LoopDetection> {
        let n = self.thresholds.no_progress_threshold;
        if history.len() < n {
            return None;
        }
        let tail = &history[history.len() - n..];
        if tail.iter().all(|a| !made_progress(a)) {
            return Some(LoopDetection {
                kind: LoopKind::NoProgress,
                confidence: 0.7,
                description: format!("last {n} actions produced no facts and no file modification"),
                suggestions: vec![
                    "try an action from a different family (inspection vs. mutation vs. verification)".to_string(),
                    "re-read the file before editing again; confirm line numbers".to_string(),
                ],
                evidence: tail.iter().map(action_evidence).collect(),
            });
        }
        None
    }
}

fn signature(record: &ActionRecord) -> String {
    format!("{}|{:?}|{}", record.action, record.target, record.parameters)
}

fn action_evidence(record: &ActionRecord) -> String {
    format!("step {}: {} -> {:?}", record.step, record.action, record.result)
}

/// Coarse error-category classifier shared with the fact extractor's
/// vocabulary: distinguishes the recurring failure shapes the P0 tool
/// handlers actually produce.
fn error_category(error: &str) -> &'static str {
    let lower = error.to_lowercase();
    if lower.contains("old_text not found") {
        "old_text_not_found"
    } else if lower.contains("not found") {
        "not_found"
    } else if lower.contains("escapes project directory") || lower.contains("ignored location") {
        "path_rejected"
    } else if lower.contains("invalid line range") {
        "invalid_range"
    } else if lower.contains("unsupported pattern") || lower.contains("control flow") {
        "unsupported_edit"
    } else if lower.contains("timed out") {
        "timeout"
    } else {
        "other"
    }
}

fn category_suggestions(category: &str) -> Vec<String> {
    match category {
        "old_text_not_found" => vec![
            "re-read the file; use line-based replace".to_string(),
            "check whitespace".to_string(),
        ],
        "not_found" => vec!["re-read the file; use line numbers".to_string(), "verify the path exists".to_string()],
        "path_rejected" => vec!["use a path relative to the project root, without `..`".to_string()],
        "invalid_range" => vec!["re-read the file to confirm its current line count before retrying".to_string()],
        "unsupported_edit" => vec!["fall back to `edit_file` or `replace_lines` for this shape".to_string()],
        "timeout" => vec!["narrow the scope of the check or test run".to_string()],
        _ => vec!["re-read the file; use line numbers".to_string()],
    }
}

fn breakout_suggestions(action: &str, error: Option<&str>) -> Vec<String> {
    if action == "edit_file" && error.map(error_category) == Some("old_text_not_found") {
        return vec![
            "re-read the file; use line-based replace".to_string(),
            "check whitespace".to_string(),
        ];
    }
    match error.map(error_category) {
        Some(category) => category_suggestions(category),
        None => vec!["re-read the file; use line numbers".to_string(), "try a different action".to_string()],
    }
}

/// A step "made progress" if it produced at least one fact, or it ran a
/// mutating action that succeeded.
fn made_progress(record: &ActionRecord) -> bool {
    if !record.facts_produced.is_empty() {
        return true;
    }
    MUTATING_ACTIONS.contains(&record.action.as_str()) && record.result == ActionOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(step: u32, name: &str, target: Option<&str>, result: ActionOutcome, facts: Vec<&str>) -> ActionRecord {
        ActionRecord {
            step,
            action: name.to_string(),
            target: target.map(|s| s.to_string()),
            parameters: json!({}),
            result,
            summary: String::new(),
            facts_produced: facts.into_iter().map(|s| s.to_string()).collect(),
            duration_ms: 1,
            error: None,
        }
    }

    fn failing_action(step: u32, name: &str, target: Option<&str>, error: &str) -> ActionRecord {
        ActionRecord { error: Some(error.to_string()), ..action(step, name, target, ActionOutcome::Failure, vec![]) }
    }

    #[test]
    fn detects_identical_action_run() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            failing_action(1, "edit_file", Some("a.rs"), "old_text not found in a.rs"),
            failing_action(2, "edit_file", Some("a.rs"), "old_text not found in a.rs"),
            failing_action(3, "edit_file", Some("a.rs"), "old_text not found in a.rs"),
        ];
        let hit = detector.detect(&history).unwrap();
        assert_eq!(hit.kind, LoopKind::IdenticalAction);
        assert!(hit.suggestions[0].starts_with("re-read the file"));
        assert_eq!(hit.evidence.len(), 3);
    }

    #[test]
    fn identical_action_does_not_fire_on_all_success() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            action(1, "read_file", Some("a.rs"), ActionOutcome::Success, vec![]),
            action(2, "read_file", Some("a.rs"), ActionOutcome::Success, vec![]),
            action(3, "read_file", Some("a.rs"), ActionOutcome::Success, vec![]),
        ];
        let hit = detector.detect(&history).unwrap();
        assert_eq!(hit.kind, LoopKind::NoProgress);
    }

    #[test]
    fn detects_error_cycle() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            failing_action(1, "run_check", Some("a.rs"), "ERROR: nope"),
            failing_action(2, "edit_file", Some("a.rs"), "ERROR: nope"),
            failing_action(3, "run_check", Some("a.rs"), "ERROR: nope"),
            failing_action(4, "edit_file", Some("a.rs"), "ERROR: nope"),
        ];
        let hit = detector.detect(&history).unwrap();
        assert_eq!(hit.kind, LoopKind::ErrorCycle);
    }

    #[test]
    fn detects_semantic_loop_by_error_category() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            failing_action(1, "edit_file", Some("a.rs"), "old_text not found in a.rs"),
            failing_action(2, "replace_lines", Some("a.rs"), "old_text not found elsewhere"),
            failing_action(3, "edit_file", Some("a.rs"), "old_text not found in a.rs"),
            failing_action(4, "insert_lines", Some("a.rs"), "old_text not found again"),
        ];
        let hit = detector.detect(&history).unwrap();
        assert_eq!(hit.kind, LoopKind::SemanticLoop);
        assert!(hit.suggestions.iter().any(|s| s.contains("whitespace")));
    }

    #[test]
    fn detects_semantic_loop_by_repeated_statement() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            failing_action(1, "edit_file", Some("a.rs"), "unsupported pattern"),
            failing_action(2, "search_code", Some("a.rs"), "unsupported pattern"),
            failing_action(3, "replace_lines", Some("a.rs"), "unsupported pattern"),
            failing_action(4, "insert_lines", Some("a.rs"), "ERROR: invalid line range"),
        ];
        let hit = detector.detect(&history).unwrap();
        assert_eq!(hit.kind, LoopKind::SemanticLoop);
    }

    #[test]
    fn detects_no_progress() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            action(1, "read_file", Some("a.rs"), ActionOutcome::Success, vec![]),
            action(2, "read_file", Some("b.rs"), ActionOutcome::Success, vec![]),
            action(3, "search_code", Some("c.rs"), ActionOutcome::Success, vec![]),
            action(4, "read_file", Some("d.rs"), ActionOutcome::Success, vec![]),
        ];
        let hit = detector.detect(&history).unwrap();
        assert_eq!(hit.kind, LoopKind::NoProgress);
    }

    #[test]
    fn progress_clears_history_of_any_detection() {
        let detector = LoopDetector::new(LoopThresholds::default());
        let history = vec![
            action(1, "read_file", Some("a.rs"), ActionOutcome::Success, vec![]),
            action(2, "read_file", Some("b.rs"), ActionOutcome::Success, vec![]),
            action(3, "edit_file", Some("c.rs"), ActionOutcome::Success, vec!["f1"]),
            action(4, "read_file", Some("d.rs"), ActionOutcome::Success, vec![]),
        ];
        assert!(detector.detect(&history).is_none());
    }
}
