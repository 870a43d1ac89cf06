//! CLI surface: `fix-violation`, `resume`, `status`, with the exit codes
//! the fix loop contracts on (0 complete, 1 escalated/failed, 2 lock busy,
//! 3 state corrupt).

use crate::driver::{HumanInTheLoopDriver, LlmDriver};
use crate::error::WorkflowError;
use crate::workflow::{FixWorkflow, WorkflowOutcome};
use agentforge_core::{StoreError, Txn, Violation};
use agentforge_runtime::BudgetConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const STATUS_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "agentforge", version, about = "Minimal-context autonomous fix loop")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root of the repository the violation lives in.
    #[arg(long, env = "AGENTFORGE_PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// Absolute per-task step cap; exceeding it forces escalation.
    #[arg(long, env = "AGENTFORGE_HARD_CEILING", default_value_t = 25)]
    hard_ceiling: u32,

    /// Starting step cap before adaptive extension on progress.
    #[arg(long, env = "AGENTFORGE_BASE_CAP", default_value_t = 25)]
    base_cap: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a fresh task from a conformance violation to a terminal outcome.
    FixViolation {
        #[arg(long)]
        id: String,
        #[arg(long)]
        check_id: String,
        #[arg(long, default_value = "error")]
        severity: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        line: Option<usize>,
        #[arg(long)]
        message: String,
        #[arg(long)]
        fix_hint: Option<String>,
        #[arg(long)]
        test_path: Option<String>,
    },
    /// Resume a task from durable state after a crash or interruption.
    Resume { task_id: String },
    /// Print the current phase and verification state of a task.
    Status { task_id: String },
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    let budget_config = BudgetConfig { base_cap: cli.base_cap, hard_ceiling: cli.hard_ceiling, extension_increment: 2 };
    let driver: Box<dyn LlmDriver> = Box::new(HumanInTheLoopDriver);

    match cli.command {
        Command::FixViolation { id, check_id, severity, file, line, message, fix_hint, test_path } => {
            let violation = Violation { id, check_id, severity, file_path: file, line_number: line, message, fix_hint, test_path };
            let mut workflow = FixWorkflow::new(cli.project_root, driver, budget_config);
            finish(workflow.run(violation).await)
        }
        Command::Resume { task_id } => {
            let mut workflow = FixWorkflow::new(cli.project_root, driver, budget_config);
            finish(workflow.resume(&task_id).await)
        }
        Command::Status { task_id } => status(&cli.project_root, &task_id),
    }
}

fn finish(result: Result<WorkflowOutcome, WorkflowError>) -> ExitCode {
    match result {
        Ok(WorkflowOutcome::Resolved(record)) => {
            println!("{}", serde_yaml::to_string(&record).unwrap_or_default());
            ExitCode::from(0)
        }
        Ok(WorkflowOutcome::Escalated(record)) => {
            eprintln!("{}", serde_yaml::to_string(&record).unwrap_or_default());
            ExitCode::from(1)
        }
        Err(WorkflowError::LockBusy(task_id)) => {
            eprintln!("task {task_id} is locked by another process");
            ExitCode::from(2)
        }
        Err(WorkflowError::Store(StoreError::LockBusy(task_id))) => {
            eprintln!("task {task_id} is locked by another process");
            ExitCode::from(2)
        }
        Err(WorkflowError::Store(StoreError::StateCorrupt(msg))) => {
            eprintln!("state corrupt: {msg}");
            ExitCode::from(3)
        }
        Err(WorkflowError::Store(StoreError::SchemaVersion { found, expected })) => {
            eprintln!("state corrupt: unknown schema version {found}, expected {expected}");
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("fix loop failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn status(project_root: &PathBuf, task_id: &str) -> ExitCode {
    match Txn::begin(project_root, task_id, STATUS_LOCK_TIMEOUT) {
        Ok(txn) => {
            println!("phase: {}", txn.phase().current_phase);
            println!("steps_in_phase: {}", txn.phase().steps_in_phase);
            println!("checks_passing: {}", txn.verification().checks_passing);
            println!("checks_failing: {}", txn.verification().checks_failing);
            println!("tests_passing: {}", txn.verification().tests_passing);
            let _ = txn.rollback();
            ExitCode::from(0)
        }
        Err(StoreError::LockBusy(id)) => {
            eprintln!("task {id} is locked by another process");
            ExitCode::from(2)
        }
        Err(StoreError::StateCorrupt(msg)) => {
            eprintln!("state corrupt: {msg}");
            ExitCode::from(3)
        }
        Err(StoreError::SchemaVersion { found, expected }) => {
            eprintln!("state corrupt: unknown schema version {found}, expected {expected}");
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("failed to read task state: {e}");
            ExitCode::from(1)
        }
    }
}
