//! External-runner tool handlers: `run_check` invokes the conformance
//! collaborator, `run_tests` invokes the test collaborator. Both are black
//! boxes known only by the textual shape of their output; this module
//! shells out and returns that output verbatim under the
//! `SUCCESS:`/`ERROR:` envelope.

use super::{str_param, ToolContext, ToolHandler};
use std::process::Command;
use std::time::Duration;

const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(120);

fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<(bool, String), String> {
    let mut child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| e.to_string())?;

    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                use std::io::Read;
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_string(&mut stdout);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut stderr);
                }
                return Ok((status.success(), format!("{stdout}\n{stderr}")));
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    return Err("timed out".to_string());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Invokes the conformance runner for the task's violation: the
/// runner's stdout is expected to contain one of `"Check PASSED"`,
/// `"Violations (N)"`, or a `"Function '<name>' has ..."` line, which the
/// fact extractor parses downstream.
pub struct RunCheckHandler;

impl ToolHandler for RunCheckHandler {
    fn name(&self) -> &'static str {
        "run_check"
    }

    fn invoke(&self, _params: &serde_json::Value, ctx: &ToolContext) -> String {
        let mut command = Command::new("agentforge-conformance-runner");
        command
            .arg("--check")
            .arg(&ctx.conformance_check_id)
            .arg("--path")
            .arg(&ctx.project_root)
            .current_dir(&ctx.project_root);

        match run_with_timeout(command, DEFAULT_TEST_TIMEOUT) {
            Ok((_, output)) => format!("SUCCESS: {}", output.trim()),
            Err(e) => format!("ERROR: check runner failed: {e}"),
        }
    }
}

/// Invokes the test runner, optionally scoped to a single test path:
/// expects a `"<K> passed"`/`"<K> failed"` summary line and
/// `"FAILED <module>::<test>"` lines per failure.
pub struct RunTestsHandler;

impl ToolHandler for RunTestsHandler {
    fn name(&self) -> &'static str {
        "run_tests"
    }

    fn invoke(&self, params: &serde_json::Value, ctx: &ToolContext) -> String {
        let mut command = Command::new("pytest");
        command.current_dir(&ctx.project_root);
        if let Some(path) = str_param(params, "path").or(ctx.test_path.as_deref()) {
            command.arg(path);
        }

        match run_with_timeout(command, DEFAULT_TEST_TIMEOUT) {
            Ok((_, output)) => format!("SUCCESS: {}", output.trim()),
            Err(e) => format!("ERROR: test runner failed: {e}"),
        }
    }
}
