//! End-to-end coverage of the fix loop through the public `FixWorkflow` API
//! (a real `Executor`, real tool handlers, a scripted model in place of a
//! network call): the happy path to `Complete`, auto-revert on a regressing
//! edit, and loop-detector-forced escalation.

use agentforge_agent::driver::LlmDriver;
use agentforge_agent::{FixWorkflow, WorkflowOutcome};
use agentforge_core::{ActionOutcome, Phase, Txn};
use agentforge_runtime::BudgetConfig;
use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::tempdir;

/// Plays back a fixed action sequence in place of a real model, falling
/// back to `escalate` once the script runs out.
struct ScriptedDriver {
    calls: AtomicUsize,
    script: Mutex<Vec<(&'static str, serde_json::Value)>>,
}

#[async_trait]
impl LlmDriver for ScriptedDriver {
    async fn invoke(&self, _system_prompt: &str, _context_payload: &str) -> Result<String, agentforge_agent::error::DriverError> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        let (name, params) = script.get(idx).cloned().unwrap_or(("escalate", serde_json::json!({})));
        Ok(format!("```action\nname: {name}\nparameters: {}\n```", serde_json::to_string(&params).unwrap()))
    }
}

fn scripted(steps: Vec<(&'static str, serde_json::Value)>) -> Box<dyn LlmDriver> {
    Box::new(ScriptedDriver { calls: AtomicUsize::new(0), script: Mutex::new(steps) })
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
}

/// Prepends `dir` to PATH for the current process. Tests that call this
/// must not run concurrently with each other (this file drives them from a
/// single `#[test]` for exactly that reason).
fn prepend_path(dir: &Path) {
    let existing = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{}", dir.display(), existing));
}

const COMPLEX_FN: &str = "def f(x):\n    if x > 0:\n        if x > 10:\n            return 1\n        return 2\n    return 0\n";

fn write_project(dir: &Path, file: &str, source: &str) {
    fs::write(dir.join(file), source).unwrap();
}

/// Both scenarios below prepend a fake `pytest`/`agentforge-conformance-runner`
/// to the process-wide `PATH`, so they run as two halves of one `#[tokio::test]`
/// rather than risk one clobbering the other's `PATH` override mid-run.
#[tokio::test]
async fn external_runner_scenarios() {
    happy_path_reaches_complete_through_all_phases().await;
    regressing_edit_is_reverted_and_recorded_as_partial().await;
}

/// Drives a task through read_file -> edit_file -> run_check -> run_tests
/// with both external runners reporting success, and expects the task to
/// reach `Phase::Complete` with the file actually edited on disk.
async fn happy_path_reaches_complete_through_all_phases() {
    let project = tempdir().unwrap();
    write_project(project.path(), "a.py", COMPLEX_FN);

    let bin = tempdir().unwrap();
    write_script(bin.path(), "agentforge-conformance-runner", "echo 'Check PASSED'");
    write_script(bin.path(), "pytest", "echo '1 passed, 0 failed'");
    prepend_path(bin.path());

    let driver = scripted(vec![
        ("read_file", serde_json::json!({"path": "a.py"})),
        ("edit_file", serde_json::json!({"path": "a.py", "old_text": "return 2", "new_text": "return 2  # ok"})),
        ("run_check", serde_json::json!({})),
        ("run_tests", serde_json::json!({})),
    ]);
    let mut workflow = FixWorkflow::new(project.path().to_path_buf(), driver, BudgetConfig::default());

    let violation = agentforge_core::Violation {
        id: "v-happy".into(),
        check_id: "complexity".into(),
        severity: "error".into(),
        file_path: "a.py".into(),
        line_number: Some(1),
        message: "too complex".into(),
        fix_hint: None,
        test_path: None,
    };

    let outcome = workflow.run(violation).await.unwrap();
    match outcome {
        WorkflowOutcome::Resolved(record) => {
            assert!(record.tests_passing);
            assert!(record.checks_passing);
            assert!(record.files_changed.contains(&"a.py".to_string()));
        }
        WorkflowOutcome::Escalated(e) => panic!("expected resolution, got escalation: {:?}", e.reason),
    }

    let edited = fs::read_to_string(project.path().join("a.py")).unwrap();
    assert!(edited.contains("return 2  # ok"));

    let txn = Txn::begin(project.path(), "fix-v-happy", Duration::from_secs(1)).unwrap();
    assert_eq!(txn.phase().current_phase, Phase::Complete);
    txn.rollback().unwrap();
}

/// A mutating edit that breaks a previously-passing test suite must be
/// reverted in place rather than left on disk, and recorded as `Partial`
/// rather than `Success`.
async fn regressing_edit_is_reverted_and_recorded_as_partial() {
    let project = tempdir().unwrap();
    write_project(project.path(), "a.py", COMPLEX_FN);

    // First pytest invocation (the model's own `run_tests` call) reports a
    // clean pass; every invocation after that reports a failure, standing
    // in for "this edit broke something that used to work".
    let bin = tempdir().unwrap();
    let counter = bin.path().join("calls");
    fs::write(&counter, "0").unwrap();
    write_script(
        bin.path(),
        "pytest",
        &format!(
            "n=$(cat {counter})\necho $((n+1)) > {counter}\nif [ \"$n\" = \"0\" ]; then echo '2 passed, 0 failed'; else echo '1 failed, 1 passed'; fi",
            counter = counter.display()
        ),
    );
    prepend_path(bin.path());

    let driver = scripted(vec![
        ("read_file", serde_json::json!({"path": "a.py"})),
        ("run_tests", serde_json::json!({})),
        ("edit_file", serde_json::json!({"path": "a.py", "old_text": "return 1", "new_text": "raise RuntimeError()"})),
        ("escalate", serde_json::json!({})),
    ]);
    let mut workflow = FixWorkflow::new(project.path().to_path_buf(), driver, BudgetConfig::default());

    let violation = agentforge_core::Violation {
        id: "v-regress".into(),
        check_id: "complexity".into(),
        severity: "error".into(),
        file_path: "a.py".into(),
        line_number: Some(1),
        message: "too complex".into(),
        fix_hint: None,
        test_path: Some("tests/test_a.py".into()),
    };

    let outcome = workflow.run(violation).await.unwrap();
    assert!(matches!(outcome, WorkflowOutcome::Escalated(_)));

    // The file on disk must be exactly as it started: the regressing edit
    // was reverted, not left half-applied.
    let content = fs::read_to_string(project.path().join("a.py")).unwrap();
    assert_eq!(content, COMPLEX_FN);

    let txn = Txn::begin(project.path(), "fix-v-regress", Duration::from_secs(1)).unwrap();
    let edit = txn.actions().iter().find(|a| a.action == "edit_file").expect("edit_file action recorded");
    assert_eq!(edit.result, ActionOutcome::Partial);
    txn.rollback().unwrap();
}

/// Repeating the same read-only action forever makes no progress; the loop
/// detector must force escalation well before any external runner is even
/// consulted.
#[tokio::test]
async fn identical_action_loop_forces_escalation() {
    let project = tempdir().unwrap();
    write_project(project.path(), "a.py", COMPLEX_FN);

    let driver = scripted(vec![
        ("read_file", serde_json::json!({"path": "a.py"})),
        ("read_file", serde_json::json!({"path": "a.py"})),
        ("read_file", serde_json::json!({"path": "a.py"})),
        ("read_file", serde_json::json!({"path": "a.py"})),
    ]);
    let mut workflow = FixWorkflow::new(project.path().to_path_buf(), driver, BudgetConfig::default());

    let violation = agentforge_core::Violation {
        id: "v-loop".into(),
        check_id: "complexity".into(),
        severity: "error".into(),
        file_path: "a.py".into(),
        line_number: Some(1),
        message: "too complex".into(),
        fix_hint: None,
        test_path: None,
    };

    let outcome = workflow.run(violation).await.unwrap();
    match outcome {
        WorkflowOutcome::Escalated(record) => {
            assert!(record.last_actions.iter().filter(|a| a.action == "read_file").count() >= 3);
        }
        WorkflowOutcome::Resolved(_) => panic!("a stuck read-only loop must not resolve"),
    }

    let txn = Txn::begin(project.path(), "fix-v-loop", Duration::from_secs(1)).unwrap();
    assert_eq!(txn.phase().current_phase, Phase::Escalated);
    txn.rollback().unwrap();
}
