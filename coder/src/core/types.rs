//! Shared deterministic types for step outcomes and task status.
//!
//! These types are persisted as part of the execution state, so their serialized
//! shape is a stable contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::plan::Plan;

/// Terminal outcome of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of executing one step.
///
/// `status` and `error` are only settable through the constructors, which keeps
/// `error` present exactly when the status is `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Workspace-relative path the step touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Command stdout or analysis summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Structured extras such as `file_hash` or `exit_code`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StepResult {
    pub fn completed() -> Self {
        Self::with_status(StepStatus::Completed, None)
    }

    pub fn skipped(note: impl Into<String>) -> Self {
        Self::with_status(StepStatus::Skipped, None).with_note(note)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::with_status(StepStatus::Failed, Some(error.into()))
    }

    fn with_status(status: StepStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            file: None,
            output: None,
            result: BTreeMap::new(),
            note: None,
        }
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.result.insert(key.to_string(), value.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Top-level task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Planning,
    Executing,
    Refining,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Refining => "refining",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What a task run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    /// Plan in effect when the task stopped; `None` if it ended before planning.
    pub plan: Option<Plan>,
    pub step_results: BTreeMap<usize, StepResult>,
    /// Conversational reply when the planner declined to produce a plan.
    pub reply: Option<String>,
    /// Number of refinements applied during this run.
    pub revisions: u32,
}

impl TaskOutcome {
    /// True when the task was answered without executing a plan.
    pub fn handled_without_plan(&self) -> bool {
        self.status == TaskStatus::Succeeded && self.reply.is_some()
    }
}
