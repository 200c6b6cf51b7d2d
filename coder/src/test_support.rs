//! Test-only fakes for every collaborator, plus a harness wiring them into
//! an executor or orchestrator.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::core::graph::DependencyGraph;
use crate::core::path::normalize_relative;
use crate::core::plan::{Plan, PlanResponse};
use crate::core::step::Step;
use crate::core::types::{StepResult, StepStatus};
use crate::io::config::AgentConfig;
use crate::io::console::{Console, EditDecision};
use crate::io::fs::{FileSystem, FsError};
use crate::io::model::{ModelClient, ModelError, ModelReply, OutputHint};
use crate::io::parser::RegexParser;
use crate::io::prompt::PromptEngine;
use crate::io::shell::{CommandResult, CommandRunner};
use crate::io::state_store::ExecutionStateStore;
use crate::io::store::{ContextStore, FileContextStore, MemoryContextStore};
use crate::orchestrator::Orchestrator;
use crate::services::Services;
use crate::step::{SharedGraph, StepExecutor};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One recorded file system call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCall {
    Read(String),
    Write(String),
    Exists(String),
    List(String),
}

/// In-memory [`FileSystem`] rooted at `/work` that records every call.
#[derive(Debug)]
pub struct MemoryFs {
    root: PathBuf,
    files: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<FsCall>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/work"),
            files: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Seed a file without recording a call.
    pub fn insert(&self, path: &str, contents: &str) {
        lock(&self.files).insert(path.to_string(), contents.to_string());
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn calls(&self) -> Vec<FsCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Paths passed to `write`, in call order.
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FsCall::Write(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: FsCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, path: &str) -> Result<String, FsError> {
        self.record(FsCall::Read(path.to_string()));
        let relative = normalize_relative(path)?;
        self.contents(&relative)
            .ok_or(FsError::NotFound(relative))
    }

    async fn write(&self, path: &str, contents: &str) -> Result<(), FsError> {
        self.record(FsCall::Write(path.to_string()));
        let relative = normalize_relative(path)?;
        self.insert(&relative, contents);
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        self.record(FsCall::Exists(path.to_string()));
        normalize_relative(path).is_ok_and(|relative| lock(&self.files).contains_key(&relative))
    }

    async fn list(&self, dir: &str, pattern: Option<&str>) -> Result<Vec<String>, FsError> {
        self.record(FsCall::List(dir.to_string()));
        let prefix = match dir.trim_matches('/') {
            "" | "." => String::new(),
            dir => format!("{}/", normalize_relative(dir)?),
        };
        let matcher = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| FsError::Io {
                op: "compile glob",
                path: dir.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            })?;
        Ok(lock(&self.files)
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .filter(|path| {
                matcher.as_ref().is_none_or(|matcher| {
                    let name = path.rsplit('/').next().unwrap_or(path.as_str());
                    matcher.matches(path) || matcher.matches(name)
                })
            })
            .cloned()
            .collect())
    }
}

/// [`ModelClient`] that hands out queued replies and records prompts.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    prompts: Mutex<Vec<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` so overlapping calls can be observed.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, reply: Result<ModelReply, ModelError>) {
        lock(&self.replies).push_back(reply);
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(ModelReply::Text(text.to_string())));
    }

    pub fn push_json(&self, value: Value) {
        self.push(Ok(ModelReply::Json(value)));
    }

    pub fn push_plan(&self, plan: &Plan) {
        let value = serde_json::to_value(PlanResponse::Plan(plan.clone()))
            .unwrap_or_else(|err| json!({"error": err.to_string()}));
        self.push_json(value);
    }

    pub fn push_refusal(&self, message: &str) {
        self.push_json(json!({"kind": "refusal", "message": message}));
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, prompt: &str, _hint: OutputHint) -> Result<ModelReply, ModelError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Unavailable("no scripted reply left".to_string())));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// [`Console`] answering from queues; empty queues fall back to the question's
/// default (confirm) or [`EditDecision::Confirm`] (review).
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    confirms: Mutex<VecDeque<bool>>,
    reviews: Mutex<VecDeque<EditDecision>>,
    questions: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    results: Mutex<Vec<(usize, StepStatus)>>,
    manual_edit: Mutex<Option<(Arc<MemoryFs>, String)>>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_confirm(&self, answer: bool) {
        lock(&self.confirms).push_back(answer);
    }

    pub fn push_review(&self, decision: EditDecision) {
        lock(&self.reviews).push_back(decision);
    }

    /// During a manual edit, replace the edited file in `fs` with `contents`.
    pub fn edit_files_with(&self, fs: Arc<MemoryFs>, contents: &str) {
        *lock(&self.manual_edit) = Some((fs, contents.to_string()));
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.questions).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    /// `(index, status)` of every result shown, in order.
    pub fn shown_results(&self) -> Vec<(usize, StepStatus)> {
        lock(&self.results).clone()
    }
}

#[async_trait]
impl Console for ScriptedConsole {
    async fn show_plan(&self, _plan: &Plan) {}

    async fn show_step(&self, _index: usize, _total: usize, _step: &Step) {}

    async fn show_result(&self, index: usize, result: &StepResult) {
        lock(&self.results).push((index, result.status()));
    }

    async fn show_message(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }

    async fn confirm(&self, question: &str, default: bool) -> bool {
        lock(&self.questions).push(question.to_string());
        lock(&self.confirms).pop_front().unwrap_or(default)
    }

    async fn review_code(&self, _path: &str, _previous: Option<&str>, _draft: &str) -> EditDecision {
        lock(&self.reviews)
            .pop_front()
            .unwrap_or(EditDecision::Confirm)
    }

    async fn wait_for_manual_edit(&self, path: &str) {
        if let Some((fs, contents)) = lock(&self.manual_edit).as_ref() {
            fs.insert(path, contents);
        }
    }
}

/// [`CommandRunner`] returning queued results (success by default).
#[derive(Debug, Default)]
pub struct RecordingCommands {
    results: Mutex<VecDeque<CommandResult>>,
    commands: Mutex<Vec<(String, PathBuf)>>,
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: CommandResult) {
        lock(&self.results).push_back(result);
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    pub fn working_dirs(&self) -> Vec<PathBuf> {
        lock(&self.commands)
            .iter()
            .map(|(_, cwd)| cwd.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingCommands {
    async fn run(&self, command: &str, cwd: &Path) -> Result<CommandResult> {
        lock(&self.commands).push((command.to_string(), cwd.to_path_buf()));
        Ok(lock(&self.results).pop_front().unwrap_or(CommandResult {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        }))
    }
}

/// All fakes plus a config, ready to build an executor or orchestrator.
pub struct Harness {
    pub fs: Arc<MemoryFs>,
    pub model: Arc<ScriptedModel>,
    pub console: Arc<ScriptedConsole>,
    pub commands: Arc<RecordingCommands>,
    pub store: Arc<MemoryContextStore>,
    pub graph: SharedGraph,
    pub config: AgentConfig,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_model(ScriptedModel::new())
    }

    pub fn with_model(model: ScriptedModel) -> Self {
        Self {
            fs: Arc::new(MemoryFs::new()),
            model: Arc::new(model),
            console: Arc::new(ScriptedConsole::new()),
            commands: Arc::new(RecordingCommands::new()),
            store: Arc::new(MemoryContextStore::new()),
            graph: Arc::new(RwLock::new(DependencyGraph::new())),
            config: AgentConfig::default(),
        }
    }

    pub fn states(&self) -> ExecutionStateStore {
        ExecutionStateStore::new(self.store.clone(), None)
    }

    pub fn services(&self) -> Services {
        Services {
            model: self.model.clone(),
            fs: self.fs.clone(),
            commands: self.commands.clone(),
            parser: Arc::new(RegexParser),
            console: self.console.clone(),
            states: self.states(),
        }
    }

    /// Executor sharing [`Harness::graph`].
    pub fn executor(&self) -> StepExecutor {
        StepExecutor::new(
            self.services(),
            Arc::new(PromptEngine::new().expect("prompt templates")),
            self.graph.clone(),
            &self.fs.root().display().to_string(),
            &self.config.quality,
        )
    }

    pub async fn orchestrator(&self) -> Orchestrator {
        Orchestrator::start(self.services(), &self.config)
            .await
            .expect("orchestrator")
    }

    pub async fn store_keys(&self, pattern: &str) -> Vec<String> {
        self.store.scan(pattern).await.expect("scan store")
    }
}

/// Scratch working directory with a file-backed context store at the default
/// `.coder/store` location, for tests that drive the binary.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl TempWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Store the binary opens for this directory under the default config.
    pub fn states(&self) -> ExecutionStateStore {
        let store = FileContextStore::new(self.path().join(".coder").join("store"));
        ExecutionStateStore::new(Arc::new(store), None)
    }

    /// Key the binary persists this directory's dependency graph under.
    pub fn project(&self) -> String {
        self.path()
            .canonicalize()
            .expect("canonicalize workspace")
            .display()
            .to_string()
    }
}
