//! Resumable execution state for one task.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::plan::Plan;
use crate::core::types::{StepResult, TaskStatus};

/// Durable record of a task run: plan, per-step results and the resume cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_id: String,
    /// Original task description.
    pub task: String,
    pub status: TaskStatus,
    pub plan: Option<Plan>,
    #[serde(default)]
    pub step_results: BTreeMap<usize, StepResult>,
    /// Index of the next step to attempt.
    #[serde(default)]
    pub next_step_index: usize,
    /// Number of refinements applied; 0 for the initial plan.
    #[serde(default)]
    pub revision: u32,
}

/// A plan that was replaced by refinement, together with its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRevision {
    pub revision: u32,
    pub plan: Plan,
    pub step_results: BTreeMap<usize, StepResult>,
}

impl ExecutionState {
    pub fn new(task_id: &str, task: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            task: task.to_string(),
            status: TaskStatus::Planning,
            plan: None,
            step_results: BTreeMap::new(),
            next_step_index: 0,
            revision: 0,
        }
    }

    /// Install the initial plan and start from the first step.
    pub fn start_plan(&mut self, plan: Plan) {
        self.plan = Some(plan);
        self.step_results.clear();
        self.next_step_index = 0;
        self.status = TaskStatus::Executing;
    }

    /// Record the outcome of step `index` and advance the cursor past it.
    pub fn record(&mut self, index: usize, result: StepResult) {
        self.step_results.insert(index, result);
        self.next_step_index = index + 1;
    }

    /// Replace the current plan with a refined one.
    ///
    /// Progress resets: the cursor goes back to 0 and results are cleared. The
    /// superseded plan and its results are returned for archiving.
    pub fn replace_plan(&mut self, plan: Plan) -> Option<PlanRevision> {
        let previous = self.plan.replace(plan).map(|old| PlanRevision {
            revision: self.revision,
            plan: old,
            step_results: std::mem::take(&mut self.step_results),
        });
        self.step_results.clear();
        self.next_step_index = 0;
        self.revision += 1;
        self.status = TaskStatus::Executing;
        previous
    }

    /// Steps left to run in the current plan.
    pub fn remaining_steps(&self) -> usize {
        self.plan
            .as_ref()
            .map(|plan| plan.steps.len().saturating_sub(self.next_step_index))
            .unwrap_or(0)
    }

    /// Index of the last attempted step when it failed and no refine-or-stop
    /// decision has been recorded for it yet.
    pub fn pending_failure(&self) -> Option<usize> {
        if self.status.is_terminal() {
            return None;
        }
        let last = self.next_step_index.checked_sub(1)?;
        self.step_results
            .get(&last)
            .filter(|result| result.is_failed())
            .map(|_| last)
    }

    /// Whether any live result of the current plan failed.
    pub fn has_failures(&self) -> bool {
        self.step_results.values().any(StepResult::is_failed)
    }

    /// A state is worth resuming when it did not reach a terminal status and
    /// either has unattempted steps or stopped at a failure awaiting a decision.
    pub fn is_resumable(&self) -> bool {
        !self.status.is_terminal()
            && (self.remaining_steps() > 0 || self.pending_failure().is_some())
    }
}
