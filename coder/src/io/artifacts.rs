//! Run artifacts under `.coder/runs/<task_id>/`.
//!
//! These are product output for humans and tooling, separate from tracing
//! diagnostics.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::plan::Plan;
use crate::core::state::PlanRevision;
use crate::core::types::{StepResult, TaskStatus};

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub results_path: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path, task_id: &str) -> Self {
        let dir = root.join(".coder").join("runs").join(task_id);
        Self {
            plan_path: dir.join("plan.json"),
            results_path: dir.join("results.json"),
            dir,
        }
    }
}

/// Contents of `results.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunResults<'a> {
    pub task_id: &'a str,
    pub task: &'a str,
    pub status: TaskStatus,
    pub revision: u32,
    pub step_results: &'a BTreeMap<usize, StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<&'a str>,
    /// Plans replaced by refinement, oldest first.
    pub superseded: &'a [PlanRevision],
}

pub fn write_plan(paths: &RunPaths, plan: &Plan) -> Result<()> {
    write_json(&paths.plan_path, plan)
}

pub fn write_results(paths: &RunPaths, results: &RunResults<'_>) -> Result<()> {
    write_json(&paths.results_path, results)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::Step;

    #[test]
    fn run_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "task-1");
        assert!(paths.dir.ends_with(Path::new(".coder/runs/task-1")));
        assert!(paths.plan_path.ends_with("plan.json"));
        assert!(paths.results_path.ends_with("results.json"));
    }

    #[test]
    fn writes_plan_and_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "task-1");
        let plan = Plan::new("u", vec![Step::run_command("list", "ls")]);
        write_plan(&paths, &plan).expect("plan");

        let mut step_results = BTreeMap::new();
        step_results.insert(0, StepResult::completed().with_output("a\n"));
        write_results(
            &paths,
            &RunResults {
                task_id: "task-1",
                task: "list files",
                status: TaskStatus::Succeeded,
                revision: 0,
                step_results: &step_results,
                reply: None,
                superseded: &[],
            },
        )
        .expect("results");

        let raw = fs::read_to_string(&paths.results_path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["step_results"]["0"]["output"], "a\n");
        let plan_back: Plan =
            serde_json::from_str(&fs::read_to_string(&paths.plan_path).expect("read"))
                .expect("plan json");
        assert_eq!(plan_back, plan);
    }
}
