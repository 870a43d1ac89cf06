//! Durable state store: per-task transactions over a YAML document set.
//!
//! Persists one directory per task under `<repo>/.agentforge/tasks/<task_id>/`:
//!
//! ```text
//! state.yaml          PhaseState + VerificationState + schema_version
//! understanding.yaml  FactStore
//! actions.yaml        Vec<ActionRecord>
//! precomputed.yaml     PrecomputedContext (written once, read-only after)
//! outputs/step_<n>.yaml
//! state.lock          fs2 advisory lock, held for the lifetime of a Txn
//! ```
//!
//! Writes go through a temp-file-then-rename sequence so a crash mid-write
//! never leaves a half-written file in place: reloading after a commit is
//! byte-identical to the state right before a crash.

use crate::error::StoreError;
use crate::facts::FactStore;
use crate::types::{ActionRecord, PhaseState, PrecomputedContext, Task, VerificationState};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const SCHEMA_VERSION: u32 = 1;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct Versioned<T> {
    schema_version: u32,
    #[serde(flatten)]
    body: T,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct StateDocument {
    phase: PhaseState,
    verification: VerificationState,
}

/// Layout helper: resolves the on-disk paths for a given task under a repo root.
#[derive(Clone, Debug)]
pub struct TaskPaths {
    root: PathBuf,
}

impl TaskPaths {
    pub fn new(repo_root: impl AsRef<Path>, task_id: &str) -> Self {
        Self {
            root: repo_root.as_ref().join(".agentforge").join("tasks").join(task_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    fn state(&self) -> PathBuf {
        self.root.join("state.yaml")
    }

    fn understanding(&self) -> PathBuf {
        self.root.join("understanding.yaml")
    }

    fn actions(&self) -> PathBuf {
        self.root.join("actions.yaml")
    }

    fn precomputed(&self) -> PathBuf {
        self.root.join("precomputed.yaml")
    }

    fn task(&self) -> PathBuf {
        self.root.join("task.yaml")
    }

    fn lock(&self) -> PathBuf {
        self.root.join("state.lock")
    }

    fn output(&self, step: u32) -> PathBuf {
        self.root.join("outputs").join(format!("step_{step}.yaml"))
    }
}

/// Atomically writes `value` as YAML to `path` via a sibling temp file and
/// rename, the crash-safety primitive every other write in this module
/// builds on.
fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().expect("path has parent");
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));
    let yaml = serde_yaml::to_string(value)?;
    {
        let mut f = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        f.write_all(yaml.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        f.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let value = serde_yaml::from_str(&raw)
        .map_err(|e| StoreError::StateCorrupt(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// A crash-safe transaction over one task's on-disk state. All reads within
/// a transaction see a consistent snapshot taken at `begin`; `commit`
/// flushes buffered writes atomically, `rollback` discards them.
pub struct Txn {
    paths: TaskPaths,
    lock_file: File,
    phase: PhaseState,
    verification: VerificationState,
    facts: FactStore,
    actions: Vec<ActionRecord>,
    precomputed: Option<PrecomputedContext>,
    task: Option<Task>,
    pending_outputs: Vec<(u32, serde_yaml::Value)>,
    closed: bool,
}

impl Txn {
    /// Opens (creating on first use) the task directory, acquires the
    /// exclusive lock, and loads current state. Blocks up to `timeout`
    /// waiting for the lock before returning `StoreError::LockBusy`.
    pub fn begin(repo_root: impl AsRef<Path>, task_id: &str, timeout: Duration) -> Result<Self, StoreError> {
        let paths = TaskPaths::new(repo_root, task_id);
        fs::create_dir_all(paths.dir()).map_err(|e| io_err(paths.dir(), e))?;
        fs::create_dir_all(paths.dir().join("outputs")).map_err(|e| io_err(paths.dir(), e))?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(paths.lock())
            .map_err(|e| io_err(&paths.lock(), e))?;
        acquire_exclusive(&lock_file, task_id, timeout)?;

        let state_doc: Option<Versioned<StateDocument>> = read_yaml(&paths.state())?;
        let (phase, verification) = match state_doc {
            Some(v) if v.schema_version == SCHEMA_VERSION => (v.body.phase, v.body.verification),
            Some(v) => return Err(StoreError::SchemaVersion { found: v.schema_version, expected: SCHEMA_VERSION }),
            None => (PhaseState::new(), VerificationState::default()),
        };

        let facts: FactStore = read_yaml(&paths.understanding())?.unwrap_or_else(|| FactStore::new(15));
        let actions: Vec<ActionRecord> = read_yaml(&paths.actions())?.unwrap_or_default();
        let precomputed: Option<PrecomputedContext> = read_yaml(&paths.precomputed())?;
        let task: Option<Task> = read_yaml(&paths.task())?;

        Ok(Self {
            paths,
            lock_file,
            phase,
            verification,
            facts,
            actions,
            precomputed,
            task,
            pending_outputs: Vec::new(),
            closed: false,
        })
    }

    pub fn phase(&self) -> &PhaseState {
        &self.phase
    }

    pub fn phase_mut(&mut self) -> &mut PhaseState {
        &mut self.phase
    }

    pub fn verification(&self) -> &VerificationState {
        &self.verification
    }

    pub fn verification_mut(&mut self) -> &mut VerificationState {
        &mut self.verification
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn facts_mut(&mut self) -> &mut FactStore {
        &mut self.facts
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn append_action(&mut self, record: ActionRecord) {
        self.actions.push(record);
    }

    pub fn precomputed(&self) -> Option<&PrecomputedContext> {
        self.precomputed.as_ref()
    }

    pub fn set_precomputed(&mut self, ctx: PrecomputedContext) {
        self.precomputed = Some(ctx);
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    /// Persists the task's identity (goal, violation, constraints) so a
    /// later `resume` can reconstruct it from `task_id` alone.
    pub fn set_task(&mut self, task: Task) {
        self.task = Some(task);
    }

    /// Buffers a step output payload to be written atomically on commit.
    pub fn write_output(&mut self, step: u32, payload: serde_yaml::Value) {
        self.pending_outputs.push((step, payload));
    }

    /// Flushes phase/verification/facts/actions/precomputed/outputs to disk
    /// via atomic rename, in an order such that a crash between writes never
    /// leaves `state.yaml` referencing facts or actions that weren't
    /// themselves durably written first.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        atomic_write(&self.paths.understanding(), &self.facts)?;
        atomic_write(&self.paths.actions(), &self.actions)?;
        if let Some(pre) = &self.precomputed {
            atomic_write(&self.paths.precomputed(), pre)?;
        }
        if let Some(task) = &self.task {
            atomic_write(&self.paths.task(), task)?;
        }
        for (step, payload) in &self.pending_outputs {
            atomic_write(&self.paths.output(*step), payload)?;
        }

        let doc = Versioned {
            schema_version: SCHEMA_VERSION,
            body: StateDocument {
                phase: self.phase.clone(),
                verification: self.verification.clone(),
            },
        };
        atomic_write(&self.paths.state(), &doc)?;

        self.closed = true;
        FileExt::unlock(&self.lock_file).map_err(|e| io_err(&self.paths.lock(), e))?;
        Ok(())
    }

    /// Discards all buffered in-memory changes; nothing is written to disk.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.closed = true;
        FileExt::unlock(&self.lock_file).map_err(|e| io_err(&self.paths.lock(), e))?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.closed {
            let _ = FileExt::unlock(&self.lock_file);
        }
    }
}

fn acquire_exclusive(file: &File, task_id: &str, timeout: Duration) -> Result<(), StoreError> {
    let deadline = Instant::now() + timeout;
    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL_INTERVAL),
            Err(_) => return Err(StoreError::LockBusy(task_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionOutcome, Fact, FactCategory};
    use tempfile::tempdir;

    #[test]
    fn commit_then_reload_is_byte_identical_in_substance() {
        let dir = tempdir().unwrap();
        let mut txn = Txn::begin(dir.path(), "task-1", Duration::from_secs(1)).unwrap();
        txn.phase_mut().steps_in_phase = 3;
        txn.facts_mut()
            .add(Fact {
                id: "f1".into(),
                category: FactCategory::CodeStructure,
                statement: "found function foo".into(),
                confidence: 0.9,
                source: "test".into(),
                step: 1,
                supersedes: None,
            })
            .unwrap();
        txn.append_action(ActionRecord {
            step: 1,
            action: "read_file".into(),
            target: Some("src/foo.rs".into()),
            parameters: serde_json::json!({}),
            result: ActionOutcome::Success,
            summary: "read".into(),
            facts_produced: vec!["f1".into()],
            duration_ms: 10,
            error: None,
        });
        txn.commit().unwrap();

        let reloaded = Txn::begin(dir.path(), "task-1", Duration::from_secs(1)).unwrap();
        assert_eq!(reloaded.phase().steps_in_phase, 3);
        assert_eq!(reloaded.facts().get_active().len(), 1);
        assert_eq!(reloaded.actions().len(), 1);
    }

    #[test]
    fn rollback_discards_changes() {
        let dir = tempdir().unwrap();
        let mut txn = Txn::begin(dir.path(), "task-2", Duration::from_secs(1)).unwrap();
        txn.phase_mut().steps_in_phase = 7;
        txn.rollback().unwrap();

        let reloaded = Txn::begin(dir.path(), "task-2", Duration::from_secs(1)).unwrap();
        assert_eq!(reloaded.phase().steps_in_phase, 0);
    }

    #[test]
    fn lock_is_exclusive_across_concurrent_begin() {
        let dir = tempdir().unwrap();
        let first = Txn::begin(dir.path(), "task-3", Duration::from_secs(1)).unwrap();
        let second = Txn::begin(dir.path(), "task-3", Duration::from_millis(100));
        assert!(second.is_err());
        first.rollback().unwrap();
        assert!(Txn::begin(dir.path(), "task-3", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn unknown_schema_version_fails_closed() {
        let dir = tempdir().unwrap();
        let paths = TaskPaths::new(dir.path(), "task-4");
        fs::create_dir_all(paths.dir()).unwrap();
        fs::create_dir_all(paths.dir().join("outputs")).unwrap();
        let bogus = Versioned {
            schema_version: 999,
            body: StateDocument {
                phase: PhaseState::new(),
                verification: VerificationState::default(),
            },
        };
        atomic_write(&paths.state(), &bogus).unwrap();

        let err = Txn::begin(dir.path(), "task-4", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, StoreError::SchemaVersion { .. }));
    }
}
