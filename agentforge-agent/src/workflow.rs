//! Fix Workflow: builds a task from a violation record,
//! precomputes its analysis once, drives the [`Executor`] to a terminal
//! outcome, and emits the corresponding record.

use crate::driver::LlmDriver;
use crate::error::WorkflowError;
use crate::executor::Executor;
use crate::precompute::precompute;
use agentforge_core::{EscalationRecord, Phase, ResolutionRecord, Task, TaskId, Txn, Violation};
use agentforge_runtime::{AdaptiveBudget, BudgetConfig, LoopDetection};
use chrono::Utc;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You are driving a bounded, single-task fix loop. Each turn you receive a \
JSON context describing the task, current understanding, and available actions. Respond with exactly \
one fenced ```action``` block naming the action and its parameters. Prefer the narrowest action that \
makes progress; call `complete` only once the conformance check and test suite both pass, `escalate` \
when you are stuck, and `cannot_fix` when the violation cannot be resolved without a broader change.";

#[derive(Debug)]
pub enum WorkflowOutcome {
    Resolved(ResolutionRecord),
    Escalated(EscalationRecord),
}

pub struct FixWorkflow {
    project_root: PathBuf,
    executor: Executor,
    budget: AdaptiveBudget,
}

impl FixWorkflow {
    pub fn new(project_root: PathBuf, driver: Box<dyn LlmDriver>, budget_config: BudgetConfig) -> Self {
        let executor = Executor::new(project_root.clone(), SYSTEM_PROMPT.to_string(), driver);
        Self { project_root, executor, budget: AdaptiveBudget::new(budget_config) }
    }

    /// Runs a fresh task to completion: builds the task, precomputes its
    /// analysis, persists both, then steps the executor until a terminal
    /// phase or the budget is exhausted.
    pub async fn run(&mut self, violation: Violation) -> Result<WorkflowOutcome, WorkflowError> {
        let task_id = TaskId::new(format!("fix-{}", violation.id));
        let task = Task::new_fix_violation(task_id.clone(), violation.clone(), Utc::now());
        self.ensure_precomputed(task_id.as_str(), &task, &violation)?;
        self.drive(task, task_id, violation.id).await
    }

    /// Resumes a previously started task from durable state alone: the
    /// task identity and precomputed analysis were persisted on the first
    /// step, so a crash between steps loses no information needed to
    /// continue after a resume.
    pub async fn resume(&mut self, task_id: &str) -> Result<WorkflowOutcome, WorkflowError> {
        let txn = Txn::begin(&self.project_root, task_id, LOCK_TIMEOUT)?;
        let task = txn
            .task()
            .cloned()
            .ok_or_else(|| WorkflowError::PrecomputeFailed(format!("no persisted task for {task_id}")))?;
        let violation_id = task.violation.id.clone();
        txn.rollback()?;
        self.drive(task, TaskId::new(task_id), violation_id).await
    }

    async fn drive(&mut self, task: Task, task_id: TaskId, violation_id: String) -> Result<WorkflowOutcome, WorkflowError> {
        let started = Instant::now();
        let mut last_loop_detection: Option<LoopDetection> = None;
        loop {
            if self.budget.is_exhausted() {
                self.force_escalate(task_id.as_str(), "adaptive step budget exhausted")?;
                return self.build_escalation(
                    task_id.as_str(),
                    "adaptive step budget exhausted".to_string(),
                    last_loop_detection.as_ref(),
                );
            }

            let outcome = self.executor.run_step(&task, task_id.as_str(), &mut self.budget).await?;

            if let Some(hit) = &outcome.loop_detection {
                tracing::warn!(task_id = task_id.as_str(), kind = ?hit.kind, "loop detector forced escalation");
                last_loop_detection = Some(hit.clone());
            }

            if outcome.terminal {
                return match outcome.phase {
                    Phase::Complete => self.build_resolution(task_id.as_str(), &violation_id, started),
                    _ => self.build_escalation(
                        task_id.as_str(),
                        format!("terminal phase {}", outcome.phase),
                        last_loop_detection.as_ref(),
                    ),
                };
            }
        }
    }

    fn ensure_precomputed(&self, task_id: &str, task: &Task, violation: &Violation) -> Result<(), WorkflowError> {
        let mut txn = Txn::begin(&self.project_root, task_id, LOCK_TIMEOUT)?;
        let mut dirty = false;
        if txn.precomputed().is_none() {
            let ctx = precompute(&self.project_root, violation)?;
            txn.set_precomputed(ctx);
            dirty = true;
        }
        if txn.task().is_none() {
            txn.set_task(task.clone());
            dirty = true;
        }
        if dirty {
            txn.commit()?;
        } else {
            txn.rollback()?;
        }
        Ok(())
    }

    fn force_escalate(&self, task_id: &str, reason: &str) -> Result<(), WorkflowError> {
        let mut txn = Txn::begin(&self.project_root, task_id, LOCK_TIMEOUT)?;
        txn.phase_mut().current_phase = Phase::Escalated;
        txn.phase_mut().steps_in_phase = 0;
        tracing::warn!(task_id, reason, "forcing escalation");
        txn.commit()?;
        Ok(())
    }

    fn build_resolution(&self, task_id: &str, violation_id: &str, started: Instant) -> Result<WorkflowOutcome, WorkflowError> {
        let txn = Txn::begin(&self.project_root, task_id, LOCK_TIMEOUT)?;
        let mut files_changed: Vec<String> = Vec::new();
        for action in txn.actions() {
            if let Some(target) = &action.target {
                if !files_changed.contains(target) {
                    files_changed.push(target.clone());
                }
            }
        }
        let record = ResolutionRecord {
            task_id: TaskId::new(task_id),
            violation_id: violation_id.to_string(),
            files_changed,
            tests_passing: txn.verification().tests_passing,
            checks_passing: txn.verification().checks_failing == 0,
            duration_ms: started.elapsed().as_millis() as u64,
            steps: txn.actions().len() as u32,
        };
        txn.rollback()?;
        Ok(WorkflowOutcome::Resolved(record))
    }

    fn build_escalation(
        &self,
        task_id: &str,
        reason: String,
        loop_detection: Option<&LoopDetection>,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let txn = Txn::begin(&self.project_root, task_id, LOCK_TIMEOUT)?;
        let last_actions = txn.actions().iter().rev().take(10).rev().cloned().collect();
        let active_facts = txn.facts().get_active().into_iter().cloned().collect();
        let diagnostic_bundle_path = self
            .project_root
            .join(".agentforge")
            .join("tasks")
            .join(task_id)
            .display()
            .to_string();
        let reason = match loop_detection {
            Some(hit) => format!("{reason}: {}", hit.description),
            None => reason,
        };
        let record = EscalationRecord {
            task_id: TaskId::new(task_id),
            reason,
            loop_detection: loop_detection.map(|hit| serde_json::to_value(hit).unwrap_or(serde_json::Value::Null)),
            last_actions,
            active_facts,
            diagnostic_bundle_path,
        };
        txn.rollback()?;
        Ok(WorkflowOutcome::Escalated(record))
    }
}
