//! Per-step file snapshot and auto-revert.
//!
//! Before a mutating handler runs, the executor snapshots every file the
//! handler declares it will touch. If the post-step test run regresses,
//! the snapshot is used to restore those files exactly, and the step's
//! `ActionRecord` is marked `partial`.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
struct FileSnapshot {
    path: PathBuf,
    original_content: Option<String>,
}

/// The set of file snapshots taken for one step. Dropped (and therefore
/// discarded) once the step commits cleanly.
#[derive(Clone, Debug, Default)]
pub struct StepSnapshot {
    snapshots: Vec<FileSnapshot>,
}

impl StepSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current content of `path` (or its absence) before a
    /// mutating handler touches it. Safe to call more than once per path;
    /// only the first snapshot per path is kept.
    pub fn snapshot(&mut self, path: &Path) {
        if self.snapshots.iter().any(|s| s.path == path) {
            return;
        }
        let original_content = fs::read_to_string(path).ok();
        self.snapshots.push(FileSnapshot { path: path.to_path_buf(), original_content });
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn touched_paths(&self) -> Vec<&Path> {
        self.snapshots.iter().map(|s| s.path.as_path()).collect()
    }

    /// Restores every snapshotted file to its pre-step state, in reverse
    /// order, deleting files that did not exist before the step.
    pub fn restore(&self) -> Result<(), String> {
        for snapshot in self.snapshots.iter().rev() {
            match &snapshot.original_content {
                Some(content) => fs::write(&snapshot.path, content).map_err(|e| e.to_string())?,
                None => {
                    if snapshot.path.exists() {
                        fs::remove_file(&snapshot.path).map_err(|e| e.to_string())?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn restores_modified_file_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "original").unwrap();

        let mut snap = StepSnapshot::new();
        snap.snapshot(&path);
        fs::write(&path, "modified").unwrap();

        snap.restore().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
    }

    #[test]
    fn restores_by_deleting_newly_created_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.py");

        let mut snap = StepSnapshot::new();
        snap.snapshot(&path);
        fs::write(&path, "created").unwrap();

        snap.restore().unwrap();
        assert!(!path.exists());
    }
}
