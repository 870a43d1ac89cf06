//! File-mutation tool handlers: read/write/edit/replace/insert/load_context.

use super::{resolve_contained_path, str_param, usize_param, ToolContext, ToolHandler};
use std::fs;
use std::io::Write;

fn read_to_string_checked(ctx: &ToolContext, raw: &str) -> Result<(std::path::PathBuf, String), String> {
    let path = resolve_contained_path(&ctx.project_root, raw)?;
    let content = fs::read_to_string(&path).map_err(|_| "not found".to_string())?;
    Ok((path, content))
}

/// Writes `content` to `path` via a temp-file-then-rename, so a crash never
/// leaves a half-written file (mirrors the state store's atomic write).
pub(crate) fn atomic_overwrite(path: &std::path::Path, content: &str) -> Result<(), String> {
    let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    let tmp = parent.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("out")));
    {
        let mut f = fs::File::create(&tmp).map_err(|e| e.to_string())?;
        f.write_all(content.as_bytes()).map_err(|e| e.to_string())?;
        f.sync_all().map_err(|e| e.to_string())?;
    }
    fs::rename(&tmp, path).map_err(|e| e.to_string())
}

pub struct ReadFileHandler;

impl ToolHandler for ReadFileHandler {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(path) = str_param(params, "path") else {
            return "ERROR: missing parameter 'path'".to_string();
        };
        match read_to_string_checked(ctx, path) {
            Ok((_, content)) => format!("SUCCESS: {content}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

pub struct WriteFileHandler;

impl ToolHandler for WriteFileHandler {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let (Some(path), Some(content)) = (str_param(params, "path"), str_param(params, "content")) else {
            return "ERROR: missing parameter 'path' or 'content'".to_string();
        };
        let resolved = match resolve_contained_path(&ctx.project_root, path) {
            Ok(p) => p,
            Err(e) => return format!("ERROR: {e}"),
        };
        match atomic_overwrite(&resolved, content) {
            Ok(()) => format!("SUCCESS: Wrote {path}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

pub struct EditFileHandler;

impl ToolHandler for EditFileHandler {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn is_mutating(&self) -> bool {
        true
    }

    /// Replaces the first occurrence of `old_text` with `new_text`. A
    /// deliberate resolution of the "what if old_text occurs more than
    /// once" open question: first-match-replace, deterministic, never an
    /// ambiguity error (see DESIGN.md).
    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let (Some(path), Some(old_text), Some(new_text)) =
            (str_param(params, "path"), str_param(params, "old_text"), str_param(params, "new_text"))
        else {
            return "ERROR: missing parameter 'path', 'old_text', or 'new_text'".to_string();
        };
        let (resolved, content) = match read_to_string_checked(ctx, path) {
            Ok(v) => v,
            Err(e) => return format!("ERROR: {e}"),
        };
        let Some(pos) = content.find(old_text) else {
            return format!("ERROR: old_text not found in {path}");
        };
        let mut replaced = String::with_capacity(content.len());
        replaced.push_str(&content[..pos]);
        replaced.push_str(new_text);
        replaced.push_str(&content[pos + old_text.len()..]);
        match atomic_overwrite(&resolved, &replaced) {
            Ok(()) => format!("SUCCESS: Edited {path}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

pub struct ReplaceLinesHandler;

impl ToolHandler for ReplaceLinesHandler {
    fn name(&self) -> &'static str {
        "replace_lines"
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(path) = str_param(params, "path") else {
            return "ERROR: missing parameter 'path'".to_string();
        };
        let (Some(start), Some(end)) = (usize_param(params, "start"), usize_param(params, "end")) else {
            return "ERROR: missing parameter 'start' or 'end'".to_string();
        };
        let Some(new_content) = str_param(params, "new_content") else {
            return "ERROR: missing parameter 'new_content'".to_string();
        };
        let (resolved, content) = match read_to_string_checked(ctx, path) {
            Ok(v) => v,
            Err(e) => return format!("ERROR: {e}"),
        };
        let mut lines: Vec<&str> = content.lines().collect();
        if start < 1 || start > end || end > lines.len() {
            return format!("ERROR: invalid line range {start}..{end} for {path} ({} lines)", lines.len());
        }
        let mut result: Vec<String> = lines.drain(..start - 1).map(|s| s.to_string()).collect();
        result.push(new_content.to_string());
        result.extend(lines.into_iter().skip(end - start + 1).map(|s| s.to_string()));
        let joined = result.join("\n") + "\n";
        match atomic_overwrite(&resolved, &joined) {
            Ok(()) => format!("SUCCESS: Replaced lines {start}..{end} in {path}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

pub struct InsertLinesHandler;

impl ToolHandler for InsertLinesHandler {
    fn name(&self) -> &'static str {
        "insert_lines"
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(path) = str_param(params, "path") else {
            return "ERROR: missing parameter 'path'".to_string();
        };
        let Some(line) = usize_param(params, "line") else {
            return "ERROR: missing parameter 'line'".to_string();
        };
        let Some(content_to_insert) = str_param(params, "content") else {
            return "ERROR: missing parameter 'content'".to_string();
        };
        let (resolved, content) = match read_to_string_checked(ctx, path) {
            Ok(v) => v,
            Err(e) => return format!("ERROR: {e}"),
        };
        let lines: Vec<&str> = content.lines().collect();
        if line > lines.len() {
            return format!("ERROR: invalid line range {line}..{line} for {path} ({} lines)", lines.len());
        }
        let mut result: Vec<String> = lines[..line].iter().map(|s| s.to_string()).collect();
        result.push(content_to_insert.to_string());
        result.extend(lines[line..].iter().map(|s| s.to_string()));
        let joined = result.join("\n") + "\n";
        match atomic_overwrite(&resolved, &joined) {
            Ok(()) => format!("SUCCESS: Inserted after line {line} in {path}"),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

/// Loads a file's content into the precomputed neighborhood for later
/// steps. Read-only: records the path as examined but does not mutate.
pub struct LoadContextHandler;

impl ToolHandler for LoadContextHandler {
    fn name(&self) -> &'static str {
        "load_context"
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(path) = str_param(params, "path") else {
            return "ERROR: missing parameter 'path'".to_string();
        };
        match read_to_string_checked(ctx, path) {
            Ok((_, content)) => format!("SUCCESS: Loaded {path} ({} bytes)", content.len()),
            Err(e) => format!("ERROR: {e}"),
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
    fn read_file_missing_returns_error() {
        let dir = tempdir().unwrap();
        let result = ReadFileHandler.invoke(&json!({"path": "missing.rs"}), &ctx(dir.path()));
        assert!(result.starts_with("ERROR:"));
    }

    #[test]
    fn edit_file_replaces_first_occurrence_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.rs");
        fs::write(&path, "foo\nfoo\n").unwrap();
        let result = EditFileHandler.invoke(
            &json!({"path": "a.rs", "old_text": "foo", "new_text": "bar"}),
            &ctx(dir.path()),
        );
        assert!(result.starts_with("SUCCESS:"));
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "bar\nfoo\n");
    }

    #[test]
    fn edit_file_old_text_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.rs");
        fs::write(&path, "hello\n").unwrap();
        let result = EditFileHandler.invoke(
            &json!({"path": "a.rs", "old_text": "missing", "new_text": "x"}),
            &ctx(dir.path()),
        );
        assert!(result.contains("old_text not found"));
    }

    #[test]
    fn replace_lines_rejects_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.rs");
        fs::write(&path, "one\ntwo\n").unwrap();
        let result = ReplaceLinesHandler.invoke(
            &json!({"path": "a.rs", "start": 1, "end": 10, "new_content": "x"}),
            &ctx(dir.path()),
        );
        assert!(result.starts_with("ERROR:"));
    }

    #[test]
    fn write_file_rejects_path_escape() {
        let dir = tempdir().unwrap();
        let result = WriteFileHandler.invoke(&json!({"path": "../evil.rs", "content": "x"}), &ctx(dir.path()));
        assert!(result.contains("escapes project directory"));
    }
}
