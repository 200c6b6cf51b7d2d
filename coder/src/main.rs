//! `coder`: plan–execute–refine coding assistant.
//!
//! Runs a task against the working directory, resuming unfinished runs, and
//! inspects the state persisted under `.coder/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use coder::core::task_id::validate_task_id;
use coder::core::types::TaskStatus;
use coder::exit_codes;
use coder::io::config::{AgentConfig, load_config, write_config};
use coder::io::console::TerminalConsole;
use coder::io::fs::LocalFs;
use coder::io::model::{CommandModel, LimitedModel};
use coder::io::parser::RegexParser;
use coder::io::shell::ShellRunner;
use coder::io::state_store::ExecutionStateStore;
use coder::io::store::FileContextStore;
use coder::logging;
use coder::orchestrator::{Orchestrator, TaskRequest};
use coder::services::Services;

const DEFAULT_CONFIG: &str = ".coder/config.toml";

#[derive(Parser)]
#[command(name = "coder", version, about = "Plan-execute-refine coding assistant")]
struct Cli {
    /// Working directory; every file a task touches must be inside it.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    /// Config file (default: `.coder/config.toml` in the working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug tracing on stderr unless `RUST_LOG` is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run without the context store: nothing is persisted, nothing resumes.
    #[arg(long, global = true)]
    no_store: bool,

    /// Override `max_concurrent_model_calls`.
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task, or resume its last unfinished run.
    Run {
        /// Task description.
        #[arg(long, conflicts_with = "task_file", required_unless_present = "task_file")]
        task: Option<String>,
        /// Read the task description from a file.
        #[arg(long)]
        task_file: Option<PathBuf>,
        /// Explicit task id (resumes that task if it is unfinished).
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Show the persisted state of a task.
    Status { task_id: String },
    /// List persisted task ids.
    List,
    /// Show the dependency graph: files, cycles and build order.
    Graph,
    /// Write the default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Resolved working directory, config and state store for one invocation.
struct Env {
    workdir: PathBuf,
    config: AgentConfig,
    states: ExecutionStateStore,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let workdir = cli
        .workdir
        .canonicalize()
        .with_context(|| format!("resolve working directory {}", cli.workdir.display()))?;
    let config_path = match &cli.config {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => workdir.join(path),
        None => workdir.join(DEFAULT_CONFIG),
    };
    let load_env = || -> Result<Env> {
        let mut config = load_config(&config_path)?;
        if let Some(max) = cli.max_concurrency {
            config.max_concurrent_model_calls = max;
            config.validate().context("invalid --max-concurrency")?;
        }
        let states = if cli.no_store {
            ExecutionStateStore::disabled()
        } else {
            let store = FileContextStore::new(workdir.join(&config.store.dir));
            ExecutionStateStore::new(Arc::new(store), config.state_ttl())
        };
        Ok(Env {
            workdir: workdir.clone(),
            config,
            states,
        })
    };

    match cli.command {
        Command::Init { force } => cmd_init(&config_path, force),
        Command::Run {
            task,
            task_file,
            task_id,
        } => cmd_run(load_env()?, task, task_file, task_id).await,
        Command::Status { task_id } => cmd_status(&load_env()?, &task_id).await,
        Command::List => cmd_list(&load_env()?).await,
        Command::Graph => cmd_graph(&load_env()?).await,
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &AgentConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(
    env: Env,
    task: Option<String>,
    task_file: Option<PathBuf>,
    task_id: Option<String>,
) -> Result<i32> {
    let description = match (task, task_file) {
        (Some(task), _) => task,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("read task file {}", path.display()))?,
        (None, None) => bail!("either --task or --task-file is required"),
    };

    let config = &env.config;
    let model = CommandModel {
        argv: config.model.command.clone(),
        workdir: env.workdir.clone(),
        timeout: Duration::from_secs(config.model.timeout_secs),
        output_limit_bytes: config.model.output_limit_bytes,
    };
    let services = Services {
        model: Arc::new(LimitedModel::new(
            Arc::new(model),
            config.max_concurrent_model_calls,
        )),
        fs: Arc::new(LocalFs::new(env.workdir.clone())),
        commands: Arc::new(ShellRunner {
            timeout: config.command_timeout(),
            output_limit_bytes: config.command_output_limit_bytes,
        }),
        parser: Arc::new(RegexParser),
        console: Arc::new(TerminalConsole),
        states: env.states.clone(),
    };
    let orchestrator = Orchestrator::start(services, config)
        .await?
        .with_run_artifacts(env.workdir.clone());

    let mut request = TaskRequest::new(&description);
    if let Some(task_id) = &task_id {
        request = request.with_task_id(task_id);
    }
    // A panic inside the task surfaces as a JoinError instead of unwinding
    // through the CLI.
    let handle = tokio::spawn(async move { orchestrator.run(request).await });
    let outcome = match handle.await {
        Ok(outcome) => outcome?,
        Err(err) => bail!("task aborted unexpectedly: {err}"),
    };

    println!("task {}: {}", outcome.task_id, outcome.status.as_str());
    if let Some(reply) = &outcome.reply {
        println!("{reply}");
    }
    Ok(match outcome.status {
        TaskStatus::Succeeded => exit_codes::OK,
        TaskStatus::Cancelled => exit_codes::CANCELLED,
        TaskStatus::Failed | TaskStatus::Planning | TaskStatus::Executing | TaskStatus::Refining => {
            exit_codes::FAILED
        }
    })
}

async fn cmd_status(env: &Env, task_id: &str) -> Result<i32> {
    validate_task_id(task_id)?;
    let Some(state) = env.states.load(task_id).await else {
        bail!("no stored state for task {task_id}");
    };
    let total = state.plan.as_ref().map_or(0, |plan| plan.steps.len());
    println!("task: {}", state.task_id);
    println!("description: {}", state.task);
    println!("status: {}", state.status.as_str());
    println!("revision: {}", state.revision);
    println!("progress: {}/{}", state.next_step_index, total);
    if let Some(plan) = &state.plan {
        for (index, step) in plan.steps.iter().enumerate() {
            let status = state
                .step_results
                .get(&index)
                .map_or("pending", |result| result.status().as_str());
            println!("  {}. [{status}] {}: {}", index + 1, step.kind, step.description);
            if let Some(error) = state.step_results.get(&index).and_then(|r| r.error()) {
                println!("     error: {error}");
            }
        }
    }
    let history = env.states.history(task_id).await;
    if !history.is_empty() {
        println!("superseded plans: {}", history.len());
    }
    Ok(exit_codes::OK)
}

async fn cmd_list(env: &Env) -> Result<i32> {
    for task_id in env.states.list_task_ids().await {
        match env.states.load(&task_id).await {
            Some(state) => println!("{task_id}\t{}", state.status.as_str()),
            None => println!("{task_id}\tunreadable"),
        }
    }
    Ok(exit_codes::OK)
}

async fn cmd_graph(env: &Env) -> Result<i32> {
    let project = env.workdir.display().to_string();
    let Some(graph) = env.states.load_graph(&project).await else {
        println!("no dependency graph recorded for {project}");
        return Ok(exit_codes::OK);
    };
    let snapshot = graph.snapshot();
    for node in &snapshot.nodes {
        let dependencies = graph.dependencies_of(node);
        if dependencies.is_empty() {
            println!("{node}");
        } else {
            println!("{node} -> {}", dependencies.join(", "));
        }
    }
    match graph.execution_order() {
        Ok(order) => println!("order: {}", order.join(", ")),
        Err(err) => println!("{err}"),
    }
    Ok(exit_codes::OK)
}
