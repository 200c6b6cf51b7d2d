//! Plan orchestrator: drives one task from planning to a terminal status.
//!
//! ```text
//! PLANNING -> EXECUTING -> SUCCEEDED | FAILED | CANCELLED
//!                 |   ^
//!                 v   |
//!               REFINING  (after a failed step, if the user asks for it)
//! ```
//!
//! State is persisted after every step attempt, so an interrupted run resumes
//! from the first step that had not been attempted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{Span, debug, error, info, instrument, warn};

use crate::agents::planner::{PlanDecoder, Planner};
use crate::agents::refiner::Refiner;
use crate::core::graph::DependencyGraph;
use crate::core::plan::{Plan, PlanResponse};
use crate::core::state::{ExecutionState, PlanRevision};
use crate::core::task_id::{derive_task_id, description_digest, validate_task_id};
use crate::core::types::{TaskOutcome, TaskStatus};
use crate::io::artifacts::{RunPaths, RunResults, write_plan, write_results};
use crate::io::config::AgentConfig;
use crate::io::prompt::PromptEngine;
use crate::services::Services;
use crate::step::{SharedGraph, StepExecutor};

/// Workspace files listed in the planning prompt, at most.
const MAX_PLANNING_FILES: usize = 200;

/// A task to run or resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub description: String,
    /// Explicit id; when absent one is derived from the description and the
    /// latest unfinished run of the same description is offered for resume.
    pub task_id: Option<String>,
}

impl TaskRequest {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

/// How a run begins after the persisted state has been consulted.
enum Start {
    Fresh(ExecutionState),
    Resume(ExecutionState),
    Declined(ExecutionState),
}

enum Planned {
    Execute,
    /// The planner answered without a plan.
    Reply(String),
    /// Planning failed or the user declined the plan; `state.status` says which.
    Stop,
}

/// Why the step loop stopped.
enum LoopEnd {
    Finished,
    Refine,
    Stop,
}

enum Refinement {
    Revised(Option<PlanRevision>),
    Declined,
    Failed(Option<String>),
}

pub struct Orchestrator {
    services: Services,
    planner: Planner,
    refiner: Refiner,
    executor: StepExecutor,
    graph: SharedGraph,
    project: String,
    max_refinements: u32,
    artifacts_root: Option<PathBuf>,
}

impl Orchestrator {
    /// Build an orchestrator and load the persisted dependency graph.
    pub async fn start(services: Services, config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        let prompts = Arc::new(PromptEngine::new()?);
        let decoder = Arc::new(PlanDecoder::new()?);
        let project = services.fs.root().display().to_string();

        let graph = match services.states.load_graph(&project).await {
            Some(graph) => {
                debug!(nodes = graph.len(), "loaded dependency graph");
                graph
            }
            None => DependencyGraph::new(),
        };
        let graph: SharedGraph = Arc::new(RwLock::new(graph));

        Ok(Self {
            planner: Planner::new(services.model.clone(), prompts.clone(), decoder.clone()),
            refiner: Refiner::new(
                services.model.clone(),
                prompts.clone(),
                decoder,
                config.refine_output_limit_bytes,
            ),
            executor: StepExecutor::new(
                services.clone(),
                prompts,
                graph.clone(),
                &project,
                &config.quality,
            ),
            services,
            graph,
            project,
            max_refinements: config.max_refinements,
            artifacts_root: None,
        })
    }

    /// Write `plan.json` / `results.json` under `root/.coder/runs/<task_id>/`.
    pub fn with_run_artifacts(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts_root = Some(root.into());
        self
    }

    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    /// Key the dependency graph is persisted under.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Run (or resume) a task to a terminal status.
    ///
    /// Step failures, planning failures and store outages are outcomes, not
    /// errors; `Err` means the request itself was unusable.
    #[instrument(skip_all, fields(task_id = tracing::field::Empty))]
    pub async fn run(&self, request: TaskRequest) -> Result<TaskOutcome> {
        let task = request.description.trim();
        if task.is_empty() {
            bail!("task description is empty");
        }
        if let Some(task_id) = &request.task_id {
            validate_task_id(task_id)?;
        }

        let (mut state, pending_failure) =
            match self.begin(task, request.task_id.as_deref()).await {
                Start::Declined(state) => {
                    info!(task_id = %state.task_id, "user declined to start the task");
                    return Ok(outcome(&state, TaskStatus::Cancelled, None));
                }
                Start::Resume(mut state) => {
                    Span::current().record("task_id", state.task_id.as_str());
                    info!(next_step = state.next_step_index, "resuming task");
                    let pending = state.pending_failure();
                    state.status = TaskStatus::Executing;
                    if let Some(plan) = &state.plan {
                        self.services.console.show_plan(plan).await;
                    }
                    (state, pending)
                }
                Start::Fresh(mut state) => {
                    Span::current().record("task_id", state.task_id.as_str());
                    self.persist(&state).await;
                    match self.plan(&mut state).await {
                        Planned::Execute => (state, None),
                        Planned::Reply(reply) => {
                            return Ok(self.finish(&state, Some(reply), &[]).await);
                        }
                        Planned::Stop => return Ok(self.finish(&state, None, &[]).await),
                    }
                }
            };

        let mut superseded = Vec::new();
        let mut reply = None;
        // A resumed run that stopped at a failure picks up at that decision
        // instead of stepping past the failed step.
        let mut end = match pending_failure {
            Some(index) => self.after_failure(&state, index).await,
            None => self.execute_plan(&mut state).await,
        };
        loop {
            match end {
                LoopEnd::Finished if state.has_failures() => {
                    state.status = TaskStatus::Failed;
                    break;
                }
                LoopEnd::Finished => {
                    state.status = TaskStatus::Succeeded;
                    break;
                }
                LoopEnd::Stop => {
                    state.status = TaskStatus::Failed;
                    break;
                }
                LoopEnd::Refine => {}
            }
            match self.refine(&mut state).await {
                Refinement::Revised(revision) => superseded.extend(revision),
                Refinement::Declined => {
                    state.status = TaskStatus::Cancelled;
                    break;
                }
                Refinement::Failed(message) => {
                    state.status = TaskStatus::Failed;
                    reply = message;
                    break;
                }
            }
            end = self.execute_plan(&mut state).await;
        }

        info!(status = state.status.as_str(), revision = state.revision, "task finished");
        Ok(self.finish(&state, reply, &superseded).await)
    }

    /// Consult the store before anything else: offer to resume an unfinished
    /// run, otherwise start a new one.
    async fn begin(&self, task: &str, task_id: Option<&str>) -> Start {
        let states = &self.services.states;
        let console = &self.services.console;
        let new_state = || {
            let id = task_id
                .map(str::to_string)
                .unwrap_or_else(|| derive_task_id(task, Utc::now()));
            ExecutionState::new(&id, task)
        };

        let existing = match task_id {
            Some(task_id) => states
                .load(task_id)
                .await
                .filter(ExecutionState::is_resumable),
            None => states.find_resumable(&description_digest(task)).await,
        };
        let Some(existing) = existing else {
            return Start::Fresh(new_state());
        };

        let total = existing.plan.as_ref().map_or(0, |plan| plan.steps.len());
        let question = match existing.pending_failure() {
            Some(index) => format!(
                "Task {} stopped after step {} of {} failed. Resume it?",
                existing.task_id,
                index + 1,
                total
            ),
            None => format!(
                "Task {} stopped before step {} of {}. Resume it?",
                existing.task_id,
                existing.next_step_index + 1,
                total
            ),
        };
        if console.confirm(&question, false).await {
            return Start::Resume(existing);
        }
        if console
            .confirm("Start the task over with a new plan?", false)
            .await
        {
            return Start::Fresh(new_state());
        }
        Start::Declined(existing)
    }

    /// PLANNING.
    async fn plan(&self, state: &mut ExecutionState) -> Planned {
        let console = &self.services.console;
        let files = match self.services.fs.list("", None).await {
            Ok(mut files) => {
                files.truncate(MAX_PLANNING_FILES);
                files
            }
            Err(err) => {
                warn!(err = %err, "could not list workspace files for planning");
                Vec::new()
            }
        };

        match self.planner.plan(&state.task, files).await {
            Ok(PlanResponse::Refusal { message }) => {
                console.show_message(&message).await;
                state.status = TaskStatus::Succeeded;
                Planned::Reply(message)
            }
            Ok(PlanResponse::Plan(plan)) => {
                console.show_plan(&plan).await;
                if console.confirm("Execute this plan?", true).await {
                    self.write_plan_artifact(&state.task_id, &plan);
                    state.start_plan(plan);
                    self.persist(state).await;
                    Planned::Execute
                } else {
                    state.plan = Some(plan);
                    state.status = TaskStatus::Cancelled;
                    Planned::Stop
                }
            }
            Err(err) => {
                error!(err = %err, "planning failed");
                console.show_message(&format!("Planning failed: {err}")).await;
                state.status = TaskStatus::Failed;
                Planned::Stop
            }
        }
    }

    /// EXECUTING. Runs steps from the cursor, persisting after each attempt.
    async fn execute_plan(&self, state: &mut ExecutionState) -> LoopEnd {
        let Some(plan) = state.plan.clone() else {
            return LoopEnd::Finished;
        };
        let console = &self.services.console;
        let total = plan.steps.len();
        while state.next_step_index < total {
            let index = state.next_step_index;
            let step = &plan.steps[index];
            console.show_step(index, total, step).await;
            let result = self.executor.execute(step, &plan.understanding).await;
            console.show_result(index, &result).await;

            let failed = result.is_failed();
            state.record(index, result);
            self.persist(state).await;
            if failed {
                return self.after_failure(state, index).await;
            }
        }
        LoopEnd::Finished
    }

    /// Refine-or-stop decision after step `index` failed.
    async fn after_failure(&self, state: &ExecutionState, index: usize) -> LoopEnd {
        let console = &self.services.console;
        if state.revision >= self.max_refinements {
            console
                .show_message(&format!(
                    "Step {} failed and the plan was already refined {} times.",
                    index + 1,
                    state.revision
                ))
                .await;
            return LoopEnd::Stop;
        }
        let question = format!("Step {} failed. Ask for a refined plan?", index + 1);
        if console.confirm(&question, true).await {
            LoopEnd::Refine
        } else {
            LoopEnd::Stop
        }
    }

    /// REFINING. On success the new plan is installed with progress reset and
    /// the superseded one archived.
    async fn refine(&self, state: &mut ExecutionState) -> Refinement {
        let Some(plan) = state.plan.clone() else {
            return Refinement::Failed(None);
        };
        let console = &self.services.console;
        state.status = TaskStatus::Refining;
        self.persist(state).await;

        let feedback = failure_feedback(state);
        let response = self
            .refiner
            .refine(&state.task, &plan, &state.step_results, feedback.as_deref())
            .await;
        match response {
            Ok(PlanResponse::Plan(revised)) => {
                console.show_plan(&revised).await;
                if !console.confirm("Execute the refined plan?", true).await {
                    return Refinement::Declined;
                }
                self.write_plan_artifact(&state.task_id, &revised);
                let revision = state.replace_plan(revised);
                if let Some(revision) = &revision {
                    self.services
                        .states
                        .archive_revision(&state.task_id, revision)
                        .await;
                }
                self.persist(state).await;
                info!(revision = state.revision, "installed refined plan");
                Refinement::Revised(revision)
            }
            Ok(PlanResponse::Refusal { message }) => {
                console.show_message(&message).await;
                Refinement::Failed(Some(message))
            }
            Err(err) => {
                error!(err = %err, "refinement failed");
                console
                    .show_message(&format!("Refinement failed: {err}"))
                    .await;
                Refinement::Failed(None)
            }
        }
    }

    async fn persist(&self, state: &ExecutionState) {
        if !self.services.states.save(state).await && self.services.states.is_enabled() {
            debug!(task_id = %state.task_id, "state not persisted; run is not resumable");
        }
    }

    async fn finish(
        &self,
        state: &ExecutionState,
        reply: Option<String>,
        superseded: &[PlanRevision],
    ) -> TaskOutcome {
        self.persist(state).await;
        if let Some(root) = &self.artifacts_root {
            let stored = self.services.states.history(&state.task_id).await;
            let superseded = if stored.is_empty() { superseded } else { &stored[..] };
            let paths = RunPaths::new(root, &state.task_id);
            let results = RunResults {
                task_id: &state.task_id,
                task: &state.task,
                status: state.status,
                revision: state.revision,
                step_results: &state.step_results,
                reply: reply.as_deref(),
                superseded,
            };
            if let Err(err) = write_results(&paths, &results) {
                warn!(err = %format!("{err:#}"), "could not write run results");
            }
        }
        outcome(state, state.status, reply)
    }

    fn write_plan_artifact(&self, task_id: &str, plan: &Plan) {
        let Some(root) = &self.artifacts_root else {
            return;
        };
        if let Err(err) = write_plan(&RunPaths::new(root, task_id), plan) {
            warn!(err = %format!("{err:#}"), "could not write plan artifact");
        }
    }
}

/// Feedback for the refiner naming the step that failed.
fn failure_feedback(state: &ExecutionState) -> Option<String> {
    let (index, result) = state
        .step_results
        .iter()
        .rev()
        .find(|(_, result)| result.is_failed())?;
    Some(format!(
        "step {index} failed: {}",
        result.error().unwrap_or("no error message")
    ))
}

fn outcome(state: &ExecutionState, status: TaskStatus, reply: Option<String>) -> TaskOutcome {
    TaskOutcome {
        task_id: state.task_id.clone(),
        status,
        plan: state.plan.clone(),
        step_results: state.step_results.clone(),
        reply,
        revisions: state.revision,
    }
}
