//! Structural edit and search handlers: `extract_function`, `simplify_conditional`,
//! `search_code`. Target sources are Python (the core assumes one language
//! per task), so these operate on indentation rather than braces.

use super::fs_ops::atomic_overwrite;
use super::{resolve_contained_path, str_param, usize_param, ToolContext, ToolHandler};
use regex::Regex;
use std::fs;

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// Extracts `lines[start..=end]` (1-indexed, inclusive) into a new function
/// inserted directly above `source_function`'s `def`, replacing the
/// selection with a call. Refuses the rewrite if the selection contains a
/// `return`, `break`, or `continue` at its own indentation level, since that
/// would change control flow once moved into a callee.
pub struct ExtractFunctionHandler;

impl ToolHandler for ExtractFunctionHandler {
    fn name(&self) -> &'static str {
        "extract_function"
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(path) = str_param(params, "path") else {
            return "ERROR: missing parameter 'path'".to_string();
        };
        let Some(source_function) = str_param(params, "source_function") else {
            return "ERROR: missing parameter 'source_function'".to_string();
        };
        let Some(new_function_name) = str_param(params, "new_function_name") else {
            return "ERROR: missing parameter 'new_function_name'".to_string();
        };
        let (Some(start_line), Some(end_line)) = (usize_param(params, "start_line"), usize_param(params, "end_line"))
        else {
            return "ERROR: missing parameter 'start_line' or 'end_line'".to_string();
        };

        let resolved = match resolve_contained_path(&ctx.project_root, path) {
            Ok(p) => p,
            Err(e) => return format!("ERROR: {e}"),
        };
        let content = match fs::read_to_string(&resolved) {
            Ok(c) => c,
            Err(_) => return "ERROR: not found".to_string(),
        };
        let lines: Vec<&str> = content.lines().collect();
        if start_line < 1 || start_line > end_line || end_line > lines.len() {
            return format!("ERROR: invalid line range {start_line}..{end_line} for {path} ({} lines)", lines.len());
        }

        let def_idx = match lines.iter().position(|l| l.trim_start().starts_with(&format!("def {source_function}("))) {
            Some(i) => i,
            None => return format!("ERROR: function '{source_function}' not found in {path}"),
        };

        let selection = &lines[start_line - 1..end_line];
        let base_indent = selection.iter().filter(|l| !l.trim().is_empty()).map(|l| indent_of(l)).min().unwrap_or(0);

        for line in selection {
            let trimmed = line.trim();
            if trimmed.starts_with("return") || trimmed == "break" || trimmed == "continue" {
                return "ERROR: selection crosses control flow".to_string();
            }
        }

        let def_indent = indent_of(lines[def_idx]);
        let call_indent = " ".repeat(base_indent);
        let new_fn_indent = " ".repeat(def_indent);
        let body_indent = " ".repeat(def_indent + 4);

        let mut new_fn = vec![format!("{new_fn_indent}def {new_function_name}():")];
        for line in selection {
            let rest = &line[base_indent.min(line.len())..];
            new_fn.push(format!("{body_indent}{rest}"));
        }
        new_fn.push(String::new());

        let mut output: Vec<String> = Vec::new();
        output.extend(lines[..def_idx].iter().map(|s| s.to_string()));
        output.extend(new_fn);
        output.extend(lines[def_idx..start_line - 1].iter().map(|s| s.to_string()));
        output.push(format!("{call_indent}{new_function_name}()"));
        output.extend(lines[end_line..].iter().map(|s| s.to_string()));

        match atomic_overwrite(&resolved, &(output.join("\n") + "\n")) {
            Ok(()) => format!("SUCCESS: Extracted {new_function_name} from {source_function} in {path}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

/// Converts `if cond: <big body> else: return <expr>` into a guard clause
/// `if not cond: return <expr>` followed by the dedented body. This is the
/// only shape this handler recognizes; anything else returns
/// `ERROR: unsupported pattern` rather than guessing (see DESIGN.md).
pub struct SimplifyConditionalHandler;

impl ToolHandler for SimplifyConditionalHandler {
    fn name(&self) -> &'static str {
        "simplify_conditional"
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(path) = str_param(params, "path") else {
            return "ERROR: missing parameter 'path'".to_string();
        };
        let Some(if_line) = usize_param(params, "if_line") else {
            return "ERROR: missing parameter 'if_line'".to_string();
        };

        let resolved = match resolve_contained_path(&ctx.project_root, path) {
            Ok(p) => p,
            Err(e) => return format!("ERROR: {e}"),
        };
        let content = match fs::read_to_string(&resolved) {
            Ok(c) => c,
            Err(_) => return "ERROR: not found".to_string(),
        };
        let lines: Vec<&str> = content.lines().collect();
        if if_line < 1 || if_line > lines.len() {
            return format!("ERROR: invalid line range {if_line}..{if_line} for {path} ({} lines)", lines.len());
        }

        let if_idx = if_line - 1;
        let if_indent = indent_of(lines[if_idx]);
        let trimmed = lines[if_idx].trim_start();
        let Some(cond) = trimmed.strip_prefix("if ").and_then(|rest| rest.strip_suffix(':')) else {
            return "ERROR: unsupported pattern".to_string();
        };

        let body_indent = if_indent + 4;
        let mut cursor = if_idx + 1;
        let mut if_body: Vec<&str> = Vec::new();
        while cursor < lines.len() && (lines[cursor].trim().is_empty() || indent_of(lines[cursor]) >= body_indent) {
            if_body.push(lines[cursor]);
            cursor += 1;
        }
        if if_body.len() < 2 {
            return "ERROR: unsupported pattern".to_string();
        }

        if cursor >= lines.len() || indent_of(lines[cursor]) != if_indent || lines[cursor].trim() != "else:" {
            return "ERROR: unsupported pattern".to_string();
        }
        let else_line_idx = cursor;
        cursor += 1;

        let mut else_body: Vec<&str> = Vec::new();
        while cursor < lines.len() && (lines[cursor].trim().is_empty() || indent_of(lines[cursor]) >= body_indent) {
            else_body.push(lines[cursor]);
            cursor += 1;
        }
        let else_statements: Vec<&&str> = else_body.iter().filter(|l| !l.trim().is_empty()).collect();
        if else_statements.len() != 1 || !else_statements[0].trim().starts_with("return") {
            return "ERROR: unsupported pattern".to_string();
        }
        let guard_return = else_statements[0].trim();

        let if_indent_str = " ".repeat(if_indent);
        let body_indent_str = " ".repeat(body_indent);
        let mut output: Vec<String> = lines[..if_idx].iter().map(|s| s.to_string()).collect();
        output.push(format!("{if_indent_str}if not ({cond}):"));
        output.push(format!("{body_indent_str}{guard_return}"));
        for line in &if_body {
            if line.trim().is_empty() {
                output.push(String::new());
            } else {
                output.push(line[4.min(line.len())..].to_string());
            }
        }
        output.extend(lines[cursor.max(else_line_idx + 1)..].iter().map(|s| s.to_string()));

        match atomic_overwrite(&resolved, &(output.join("\n") + "\n")) {
            Ok(()) => format!("SUCCESS: Simplified conditional at line {if_line} in {path}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

/// Regex-based lexical search over project files under `project_root`
/// (excluding ignored directories). The semantic half of the hybrid
/// retrieval this action nominally offers — LSP indexing and vector
/// search — is an external collaborator and is not implemented here;
/// this handler covers the lexical half only.
pub struct SearchCodeHandler;

const TOP_K: usize = 20;

impl ToolHandler for SearchCodeHandler {
    fn name(&self) -> &'static str {
        "search_code"
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(query) = str_param(params, "query") else {
            return "ERROR: missing parameter 'query'".to_string();
        };
        let re = match Regex::new(query) {
            Ok(r) => r,
            Err(e) => return format!("ERROR: invalid regex: {e}"),
        };

        let mut hits = Vec::new();
        walk(&ctx.project_root, &mut |path| {
            if hits.len() >= TOP_K {
                return;
            }
            let Ok(content) = fs::read_to_string(path) else { return };
            for (idx, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    hits.push(format!("{}:{}: {}", path.display(), idx + 1, line.trim()));
                    if hits.len() >= TOP_K {
                        break;
                    }
                }
            }
        });

        if hits.is_empty() {
            "SUCCESS: 0 results".to_string()
        } else {
            format!("SUCCESS: {} results\n{}", hits.len(), hits.join("\n"))
        }
    }
}

fn walk(dir: &std::path::Path, visit: &mut impl FnMut(&std::path::Path)) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if super::IGNORED_DIRS.contains(&name.as_ref()) {
            continue;
        }
        if path.is_dir() {
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn ctx(root: &std::path::Path) -> ToolContext {
        ToolContext {
            project_root: root.to_path_buf(),
            task_id: "t1".into(),
            violation_id: "v1".into(),
            files_examined: vec![],
            phase: agentforge_core::Phase::Implement,
            conformance_check_id: "complexity".into(),
            test_path: None,
        }
    }

    #[test]
    fn simplify_conditional_converts_if_else_return() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(
            &path,
            "def f(x):\n    if x > 0:\n        do_a()\n        do_b()\n    else:\n        return None\n    return 1\n",
        )
        .unwrap();
        let result = SimplifyConditionalHandler.invoke(&json!({"path": "a.py", "if_line": 2}), &ctx(dir.path()));
        assert!(result.starts_with("SUCCESS:"), "{result}");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("if not (x > 0):"));
        assert!(content.contains("return None"));
    }

    #[test]
    fn simplify_conditional_rejects_missing_else() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "def f(x):\n    if x > 0:\n        do_a()\n    return 1\n").unwrap();
        let result = SimplifyConditionalHandler.invoke(&json!({"path": "a.py", "if_line": 2}), &ctx(dir.path()));
        assert_eq!(result, "ERROR: unsupported pattern");
    }

    #[test]
    fn extract_function_rejects_selection_with_return() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "def f(x):\n    if x:\n        return 1\n    return 0\n").unwrap();
        let result = ExtractFunctionHandler.invoke(
            &json!({"path": "a.py", "source_function": "f", "start_line": 2, "end_line": 3, "new_function_name": "g"}),
            &ctx(dir.path()),
        );
        assert_eq!(result, "ERROR: selection crosses control flow");
    }

    #[test]
    fn search_code_finds_matches() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "def foo():\n    pass\n").unwrap();
        let result = SearchCodeHandler.invoke(&json!({"query": "def foo"}), &ctx(dir.path()));
        assert!(result.starts_with("SUCCESS: 1 results"));
    }
}
