//! Tool Handlers: the central registry of named actions the executor
//! dispatches model-chosen actions through.

mod checks;
mod code_ops;
mod fs_ops;

use agentforge_core::Phase;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

pub use checks::{RunCheckHandler, RunTestsHandler};
pub use code_ops::{ExtractFunctionHandler, SearchCodeHandler, SimplifyConditionalHandler};
pub use fs_ops::{EditFileHandler, InsertLinesHandler, LoadContextHandler, ReadFileHandler, ReplaceLinesHandler, WriteFileHandler};

pub(crate) const IGNORED_DIRS: &[&str] = &[".git", "venv", ".venv", "node_modules", "target", "build", "dist"];

/// Per-step context the executor injects into every handler call as
/// `params._context`.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub project_root: PathBuf,
    pub task_id: String,
    pub violation_id: String,
    pub files_examined: Vec<String>,
    pub phase: Phase,
    pub conformance_check_id: String,
    pub test_path: Option<String>,
}

pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String;
    fn is_mutating(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<&'static str, Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Registers the mandatory P0 handler set. `complete`,
    /// `escalate`, and `cannot_fix` are not registered here: they are
    /// terminal requests the executor recognizes directly rather than tool
    /// invocations with a result string.
    pub fn with_p0_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ReadFileHandler));
        registry.register(Box::new(WriteFileHandler));
        registry.register(Box::new(EditFileHandler));
        registry.register(Box::new(ReplaceLinesHandler));
        registry.register(Box::new(InsertLinesHandler));
        registry.register(Box::new(LoadContextHandler));
        registry.register(Box::new(ExtractFunctionHandler));
        registry.register(Box::new(SimplifyConditionalHandler));
        registry.register(Box::new(SearchCodeHandler));
        registry.register(Box::new(RunCheckHandler));
        registry.register(Box::new(RunTestsHandler));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn ToolHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.handlers.get(name).map(|b| b.as_ref())
    }
}

/// Resolves `raw` against `project_root`, rejecting any path that would
/// escape it (via `..`) or land in an ignored directory.
/// Purely lexical: does not require the target to exist, so it works for
/// `write_file` creating a new file.
pub fn resolve_contained_path(project_root: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() { candidate.to_path_buf() } else { project_root.join(candidate) };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err("Path escapes project directory".to_string());
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    if !normalized.starts_with(project_root) {
        return Err("Path escapes project directory".to_string());
    }

    if normalized.components().any(|c| matches!(c, Component::Normal(s) if IGNORED_DIRS.contains(&s.to_string_lossy().as_ref()))) {
        return Err(format!("Path touches an ignored location: {}", normalized.display()));
    }

    Ok(normalized)
}

pub(crate) fn str_param<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub(crate) fn usize_param(params: &serde_json::Value, key: &str) -> Option<usize> {
    params.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_escape() {
        let root = Path::new("/repo");
        assert!(resolve_contained_path(root, "../outside.rs").is_err());
    }

    #[test]
    fn rejects_absolute_path_outside_root() {
        let root = Path::new("/repo");
        assert!(resolve_contained_path(root, "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_ignored_directory() {
        let root = Path::new("/repo");
        assert!(resolve_contained_path(root, ".git/config").is_err());
    }

    #[test]
    fn accepts_relative_path_within_root() {
        let root = Path::new("/repo");
        let resolved = resolve_contained_path(root, "src/lib.rs").unwrap();
        assert_eq!(resolved, Path::new("/repo/src/lib.rs"));
    }
}
