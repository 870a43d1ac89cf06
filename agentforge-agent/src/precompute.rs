//! Precomputation: a deterministic, once-per-task analysis pass run before
//! the first step, so the loop never re-derives the same facts about the
//! violating function at every step.
//!
//! Complexity estimation follows the same per-line branching-keyword count
//! the conformance checks themselves use, just summed over a function body
//! instead of a single declaration line, and adapted to Python keywords
//! since the target codebase is Python.

use crate::error::WorkflowError;
use agentforge_core::{ComplexityMetrics, ExtractionSuggestion, PrecomputedContext, ViolatingFunction, Violation};
use std::fs;
use std::path::Path;

const BRANCH_KEYWORDS: &[&str] = &["if ", "elif ", "while ", "for ", "except", "and ", "or "];

pub fn precompute(project_root: &Path, violation: &Violation) -> Result<PrecomputedContext, WorkflowError> {
    let path = project_root.join(&violation.file_path);
    let content = fs::read_to_string(&path)
        .map_err(|e| WorkflowError::PrecomputeFailed(format!("reading {}: {e}", path.display())))?;
    let lines: Vec<&str> = content.lines().collect();

    let violating_function = locate_function(&lines, violation.line_number)
        .ok_or_else(|| WorkflowError::PrecomputeFailed(format!("no function found around line {:?} in {}", violation.line_number, violation.file_path)))?;

    let complexity_metrics = estimate_complexity(&violating_function);
    let extraction_suggestions = suggest_extractions(&violating_function);
    let imports: Vec<String> = lines
        .iter()
        .take_while(|l| l.trim().is_empty() || l.trim_start().starts_with("import ") || l.trim_start().starts_with("from "))
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect();

    let neighborhood_start = violating_function.start_line.saturating_sub(6).max(1);
    let neighborhood_end = (violating_function.start_line + 5).min(lines.len());
    let neighborhood = lines[neighborhood_start - 1..neighborhood_end].join("\n");

    Ok(PrecomputedContext { violating_function, neighborhood, imports, complexity_metrics, extraction_suggestions })
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// Finds the `def` whose body spans `target_line` (or the first function in
/// the file when no line number is given), by scanning for the next line at
/// or below the `def`'s own indentation.
fn locate_function(lines: &[&str], target_line: Option<usize>) -> Option<ViolatingFunction> {
    let def_indices: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.trim_start().starts_with("def "))
        .map(|(i, _)| i)
        .collect();

    let def_idx = match target_line {
        Some(target) => def_indices
            .iter()
            .rev()
            .find(|&&i| i + 1 <= target)
            .copied()
            .or_else(|| def_indices.first().copied())?,
        None => *def_indices.first()?,
    };

    let def_indent = indent_of(lines[def_idx]);
    let mut end = lines.len();
    for (i, line) in lines.iter().enumerate().skip(def_idx + 1) {
        if !line.trim().is_empty() && indent_of(line) <= def_indent {
            end = i;
            break;
        }
    }

    let name = lines[def_idx]
        .trim_start()
        .strip_prefix("def ")
        .and_then(|rest| rest.split('(').next())
        .unwrap_or("unknown")
        .to_string();

    Some(ViolatingFunction { name, source: lines[def_idx..end].join("\n"), start_line: def_idx + 1, end_line: end })
}

fn estimate_complexity(function: &ViolatingFunction) -> ComplexityMetrics {
    let def_indent = indent_of(function.source.lines().next().unwrap_or(""));
    let mut cyclomatic_complexity = 1;
    let mut max_depth = 0;
    for line in function.source.lines() {
        if line.trim().is_empty() {
            continue;
        }
        for keyword in BRANCH_KEYWORDS {
            cyclomatic_complexity += line.matches(keyword).count() as u32;
        }
        let depth = (indent_of(line).saturating_sub(def_indent)) / 4;
        max_depth = max_depth.max(depth);
    }

    ComplexityMetrics {
        cyclomatic_complexity,
        line_count: function.source.lines().count(),
        nesting_depth: max_depth as u32,
    }
}

/// Flags contiguous blocks nested two or more levels deeper than the
/// function body as extraction candidates. A purely syntactic heuristic: it
/// does not check that the block is control-flow-safe to extract
/// (`extract_function` itself does).
fn suggest_extractions(function: &ViolatingFunction) -> Vec<ExtractionSuggestion> {
    let lines: Vec<&str> = function.source.lines().collect();
    if lines.is_empty() {
        return vec![];
    }
    let def_indent = indent_of(lines[0]);
    let deep_indent = def_indent + 12; // two levels below the body

    let mut suggestions = Vec::new();
    let mut block_start: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        let deep = !line.trim().is_empty() && indent_of(line) >= deep_indent;
        match (deep, block_start) {
            (true, None) => block_start = Some(i),
            (false, Some(start)) if i - start >= 2 => {
                suggestions.push(ExtractionSuggestion {
                    start_line: function.start_line + start,
                    end_line: function.start_line + i - 1,
                    tag: "nested_block".to_string(),
                });
                block_start = None;
            }
            (false, Some(_)) => block_start = None,
            _ => {}
        }
    }
    if let Some(start) = block_start {
        if lines.len() - start >= 2 {
            suggestions.push(ExtractionSuggestion {
                start_line: function.start_line + start,
                end_line: function.start_line + lines.len() - 1,
                tag: "nested_block".to_string(),
            });
        }
    }
    suggestions.truncate(3);
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn violation(file_path: &str, line: usize) -> Violation {
        Violation {
            id: "v1".into(),
            check_id: "complexity".into(),
            severity: "error".into(),
            file_path: file_path.into(),
            line_number: Some(line),
            message: "too complex".into(),
            fix_hint: None,
            test_path: None,
        }
    }

    #[test]
    fn locates_function_and_estimates_complexity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(
            &path,
            "import os\n\ndef f(x):\n    if x > 0:\n        if x > 10:\n            return 1\n        return 2\n    return 0\n",
        )
        .unwrap();
        let pre = precompute(dir.path(), &violation("a.py", 4)).unwrap();
        assert_eq!(pre.violating_function.name, "f");
        assert!(pre.complexity_metrics.cyclomatic_complexity >= 3);
        assert_eq!(pre.imports, vec!["import os"]);
    }

    #[test]
    fn suggests_nested_block_extraction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(
            &path,
            "def f(x):\n    if x:\n        if x > 1:\n            do_a()\n            do_b()\n    return 0\n",
        )
        .unwrap();
        let pre = precompute(dir.path(), &violation("a.py", 1)).unwrap();
        assert!(!pre.extraction_suggestions.is_empty());
    }

    #[test]
    fn missing_file_is_precompute_failed() {
        let dir = tempdir().unwrap();
        let err = precompute(dir.path(), &violation("missing.py", 1)).unwrap_err();
        assert!(matches!(err, WorkflowError::PrecomputeFailed(_)));
    }
}
