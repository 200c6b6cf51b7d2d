//! Step executor: performs one plan step and reports a [`StepResult`].
//!
//! Every failure, expected or not, comes back as a `failed` result; nothing
//! escapes [`StepExecutor::execute`]. Validation and path checks run before
//! any collaborator is touched.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::agents::coder::CodeAgent;
use crate::agents::improver::Improver;
use crate::core::graph::DependencyGraph;
use crate::core::imports::resolve_imports;
use crate::core::language::Language;
use crate::core::path::normalize_relative;
use crate::core::step::{DEFAULT_ANALYSIS_FOCUS, Step, StepAction};
use crate::core::types::StepResult;
use crate::io::config::QualityConfig;
use crate::io::console::EditDecision;
use crate::io::parser::analyze;
use crate::io::prompt::{GenerationContext, ModificationContext, PromptEngine};
use crate::services::Services;

/// Dependency graph shared by every task of one project.
pub type SharedGraph = Arc<RwLock<DependencyGraph>>;

pub struct StepExecutor {
    services: Services,
    coder: CodeAgent,
    improver: Option<Improver>,
    graph: SharedGraph,
    /// Key under which the graph snapshot is persisted.
    project: String,
}

impl StepExecutor {
    pub fn new(
        services: Services,
        prompts: Arc<PromptEngine>,
        graph: SharedGraph,
        project: &str,
        quality: &QualityConfig,
    ) -> Self {
        let coder = CodeAgent::new(services.model.clone(), prompts.clone());
        let improver = (quality.max_rounds > 0).then(|| {
            Improver::new(
                services.model.clone(),
                prompts,
                quality.threshold,
                quality.max_rounds,
            )
        });
        Self {
            services,
            coder,
            improver,
            graph,
            project: project.to_string(),
        }
    }

    /// Run `step`. `task_summary` is the plan's understanding of the task,
    /// passed to the model as context.
    #[instrument(skip_all, fields(kind = %step.kind))]
    pub async fn execute(&self, step: &Step, task_summary: &str) -> StepResult {
        let action = match step.validate() {
            Ok(action) => action,
            Err(err) => {
                warn!(err = %err, "rejecting invalid step");
                return StepResult::failed(format!("invalid step: {err}"));
            }
        };
        for warning in step.warnings() {
            warn!("{warning}");
        }

        // Any file_path is checked, even on kinds that do not use one.
        let raw_path = action.file_path().or_else(|| {
            step.file_path
                .as_deref()
                .filter(|path| !path.trim().is_empty())
        });
        let path = match raw_path.map(normalize_relative).transpose() {
            Ok(path) => path,
            Err(err) => {
                warn!(err = %err, "rejecting file_path outside the working directory");
                return StepResult::failed(format!("rejected file_path: {err}"));
            }
        };

        let outcome = match action {
            StepAction::RunCommand { command } => self.run_command(command).await,
            StepAction::Generate { requirements, .. } => match path.as_deref() {
                Some(path) => self.generate(step, path, requirements, task_summary).await,
                None => Err(anyhow!("generate step has no file_path")),
            },
            StepAction::Modify { requirements, .. } => match path.as_deref() {
                Some(path) => self.modify(step, path, requirements, task_summary).await,
                None => Err(anyhow!("modify step has no file_path")),
            },
            StepAction::Analyze { focus, .. } => match path.as_deref() {
                Some(path) => self.analyze(path, focus).await,
                None => Err(anyhow!("analyze step has no file_path")),
            },
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "step failed");
                let result = StepResult::failed(format!("{err:#}"));
                match path {
                    Some(path) => result.with_file(path),
                    None => result,
                }
            }
        }
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn generate(
        &self,
        step: &Step,
        path: &str,
        requirements: Option<&str>,
        task_summary: &str,
    ) -> Result<StepResult> {
        let fs = &self.services.fs;
        let previous = if fs.exists(path).await {
            let overwrite = self
                .services
                .console
                .confirm(&format!("{path} already exists. Overwrite it?"), false)
                .await;
            if !overwrite {
                return Ok(StepResult::skipped("user declined overwrite").with_file(path));
            }
            Some(fs.read(path).await.with_context(|| format!("read {path}"))?)
        } else {
            None
        };

        let language = Language::from_path(path);
        let ctx = GenerationContext {
            task_summary: task_summary.to_string(),
            target_path: path.to_string(),
            language,
            step_description: step.description.clone(),
            requirements: requirements.map(str::to_string),
        };
        let draft = match self.coder.generate(&ctx).await {
            Ok(draft) => draft,
            Err(err) => return Ok(StepResult::failed(err.to_string()).with_file(path)),
        };
        self.review_and_write(path, language, previous.as_deref(), draft)
            .await
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn modify(
        &self,
        step: &Step,
        path: &str,
        requirements: Option<&str>,
        task_summary: &str,
    ) -> Result<StepResult> {
        let fs = &self.services.fs;
        if !fs.exists(path).await {
            return Ok(
                StepResult::failed(format!("cannot modify {path}: file does not exist"))
                    .with_file(path),
            );
        }
        let existing = fs.read(path).await.with_context(|| format!("read {path}"))?;

        let language = Language::from_path(path);
        let analysis = match analyze(self.services.parser.as_ref(), &existing, language) {
            Ok(analysis) => Some(analysis.summary(DEFAULT_ANALYSIS_FOCUS)),
            Err(err) => {
                warn!(err = %err, "structural analysis unavailable");
                None
            }
        };
        let ctx = ModificationContext {
            task_summary: task_summary.to_string(),
            target_path: path.to_string(),
            language,
            step_description: step.description.clone(),
            requirements: requirements.map(str::to_string),
            existing_code: existing.clone(),
            analysis,
        };
        let draft = match self.coder.modify(&ctx).await {
            Ok(draft) => draft,
            Err(err) => return Ok(StepResult::failed(err.to_string()).with_file(path)),
        };
        self.review_and_write(path, language, Some(&existing), draft)
            .await
    }

    /// Shared tail of generate/modify: optional quality loop, user review,
    /// write, then hash and graph bookkeeping.
    async fn review_and_write(
        &self,
        path: &str,
        language: Language,
        previous: Option<&str>,
        draft: String,
    ) -> Result<StepResult> {
        let draft = self.improve(path, language, draft).await;
        let fs = &self.services.fs;
        let console = &self.services.console;

        let content = match console.review_code(path, previous, &draft).await {
            EditDecision::Cancel => {
                return Ok(StepResult::skipped("user cancelled the change").with_file(path));
            }
            EditDecision::Confirm => {
                fs.write(path, &draft)
                    .await
                    .with_context(|| format!("write {path}"))?;
                draft
            }
            EditDecision::Edit => {
                fs.write(path, &draft)
                    .await
                    .with_context(|| format!("write {path}"))?;
                console.wait_for_manual_edit(path).await;
                fs.read(path)
                    .await
                    .with_context(|| format!("re-read {path} after manual edit"))?
            }
        };
        info!(bytes = content.len(), "wrote file");

        let hash = hex::encode(Sha256::digest(content.as_bytes()));
        let mut result = StepResult::completed()
            .with_file(path)
            .with_extra("file_hash", hash)
            .with_extra("language", language.as_str());
        if let Some(functions) = self.track(path, language, &content).await {
            result = result.with_extra("functions", functions);
        }
        Ok(result)
    }

    async fn improve(&self, path: &str, language: Language, draft: String) -> String {
        let Some(improver) = &self.improver else {
            return draft;
        };
        let improvement = improver.improve(path, language, draft).await;
        if let Some(record) = &improvement.record {
            self.services
                .states
                .save_improvement(record, Utc::now().timestamp())
                .await;
        }
        improvement.code
    }

    /// Re-analyze written content and record its imports in the graph.
    ///
    /// Returns the function names found, or `None` when analysis failed; the
    /// file is tracked either way.
    async fn track(&self, path: &str, language: Language, content: &str) -> Option<Vec<String>> {
        let analysis = match analyze(self.services.parser.as_ref(), content, language) {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                warn!(path, err = %err, "post-write analysis failed; tracking without dependencies");
                None
            }
        };
        let imports = analysis
            .as_ref()
            .map(|analysis| analysis.imports.clone())
            .unwrap_or_default();

        let mut graph = self.graph.write().await;
        let dependencies = resolve_imports(path, language, &imports, |candidate| {
            graph.contains(candidate)
        });
        let ignored = graph.add_file(path, &dependencies);
        debug!(
            path,
            dependencies = dependencies.len(),
            ignored = ignored.len(),
            "updated dependency graph"
        );
        self.services.states.save_graph(&self.project, &graph).await;
        drop(graph);

        analysis.map(|analysis| {
            analysis
                .functions
                .into_iter()
                .map(|function| function.name)
                .collect()
        })
    }

    #[instrument(skip_all)]
    async fn run_command(&self, command: &str) -> Result<StepResult> {
        let run = self
            .services
            .console
            .confirm(&format!("Run `{command}`?"), true)
            .await;
        if !run {
            return Ok(StepResult::skipped("user declined to run the command"));
        }

        let output = self
            .services
            .commands
            .run(command, self.services.fs.root())
            .await
            .with_context(|| format!("run `{command}`"))?;

        let mut result = if output.success() {
            StepResult::completed()
        } else {
            let stderr = output.stderr.trim_end();
            let error = if output.timed_out {
                format!("command timed out\n{stderr}").trim_end().to_string()
            } else if !stderr.is_empty() {
                stderr.to_string()
            } else {
                match output.exit_code {
                    Some(code) => format!("command exited with status {code}"),
                    None => "command was terminated by a signal".to_string(),
                }
            };
            StepResult::failed(error)
        };
        result = result.with_output(output.stdout);
        if let Some(code) = output.exit_code {
            result = result.with_extra("exit_code", code);
        }
        if output.timed_out {
            result = result.with_extra("timed_out", true);
        }
        Ok(result)
    }

    #[instrument(skip_all, fields(path = %path, focus = %focus))]
    async fn analyze(&self, path: &str, focus: &str) -> Result<StepResult> {
        let fs = &self.services.fs;
        if !fs.exists(path).await {
            return Ok(
                StepResult::failed(format!("cannot analyze {path}: file does not exist"))
                    .with_file(path),
            );
        }
        let code = fs.read(path).await.with_context(|| format!("read {path}"))?;
        let language = Language::from_path(path);
        let result = match analyze(self.services.parser.as_ref(), &code, language) {
            Ok(analysis) => StepResult::completed()
                .with_file(path)
                .with_output(analysis.summary(focus))
                .with_extra("line_count", analysis.line_count)
                .with_extra("imports", analysis.imports),
            Err(err) => {
                warn!(err = %err, "analysis unavailable");
                StepResult::completed()
                    .with_file(path)
                    .with_note(format!("analysis unavailable: {err}"))
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::StepKind;
    use crate::core::types::StepStatus;
    use crate::io::model::{ModelError, ModelReply};
    use crate::io::shell::CommandResult;
    use crate::test_support::Harness;

    #[tokio::test]
    async fn unknown_kinds_fail_before_any_io() {
        let harness = Harness::new();
        let step = Step::bare(StepKind::Unknown("deploy".to_string()), "ship it");
        let result = harness.executor().execute(&step, "t").await;
        assert_eq!(result.status(), StepStatus::Failed);
        assert!(result.error().unwrap_or_default().contains("deploy"));
        assert_eq!(harness.fs.call_count(), 0);
        assert!(harness.console.questions().is_empty());
    }

    #[tokio::test]
    async fn absolute_paths_are_rejected() {
        let harness = Harness::new();
        let step = Step::analyze("look", "/etc/passwd", None);
        let result = harness.executor().execute(&step, "t").await;
        assert!(result.is_failed());
        assert!(result.error().unwrap_or_default().contains("rejected file_path"));
        assert_eq!(harness.fs.call_count(), 0);
    }

    #[tokio::test]
    async fn model_error_payload_fails_generate_verbatim() {
        let harness = Harness::new();
        harness
            .model
            .push(Err(ModelError::Provider("insufficient quota".to_string())));
        let step = Step::generate("write", "a.py", "x");
        let result = harness.executor().execute(&step, "t").await;
        assert!(result.is_failed());
        assert_eq!(result.error(), Some("insufficient quota"));
        assert!(harness.fs.writes().is_empty());
    }

    #[tokio::test]
    async fn cancelled_review_skips_without_writing() {
        let harness = Harness::new();
        harness.model.push_text("print('hi')");
        harness.console.push_review(EditDecision::Cancel);
        let result = harness
            .executor()
            .execute(&Step::generate("write", "a.py", "x"), "t")
            .await;
        assert_eq!(result.status(), StepStatus::Skipped);
        assert!(harness.fs.writes().is_empty());
    }

    #[tokio::test]
    async fn manual_edits_become_the_final_content() {
        let harness = Harness::new();
        harness.model.push_text("print('draft')");
        harness.console.push_review(EditDecision::Edit);
        harness
            .console
            .edit_files_with(harness.fs.clone(), "print('edited')\n");
        let result = harness
            .executor()
            .execute(&Step::generate("write", "a.py", "x"), "t")
            .await;
        assert_eq!(result.status(), StepStatus::Completed);
        assert_eq!(
            harness.fs.contents("a.py").as_deref(),
            Some("print('edited')\n")
        );
        let expected = hex::encode(Sha256::digest(b"print('edited')\n"));
        assert_eq!(result.result["file_hash"], expected.as_str());
    }

    #[tokio::test]
    async fn modify_tracks_resolved_imports() {
        let harness = Harness::new();
        harness.fs.insert("app/models.py", "class User: pass\n");
        harness.fs.insert("app/main.py", "print(1)\n");
        harness.graph.write().await.add_file("app/models.py", &[]);

        harness
            .model
            .push_text("from app.models import User\n\ndef main():\n    return User()\n");
        let result = harness
            .executor()
            .execute(
                &Step::modify("use models", "app/main.py", "import User"),
                "t",
            )
            .await;
        assert_eq!(result.status(), StepStatus::Completed);
        let graph = harness.graph.read().await;
        assert_eq!(graph.dependencies_of("app/main.py"), vec!["app/models.py"]);
        assert_eq!(result.result["functions"], serde_json::json!(["main"]));
    }

    #[tokio::test]
    async fn declined_command_is_skipped_and_not_run() {
        let harness = Harness::new();
        harness.console.push_confirm(false);
        let result = harness
            .executor()
            .execute(&Step::run_command("clean", "rm -rf build"), "t")
            .await;
        assert_eq!(result.status(), StepStatus::Skipped);
        assert!(harness.commands.commands().is_empty());
    }

    #[tokio::test]
    async fn failing_command_reports_stderr_and_stdout() {
        let harness = Harness::new();
        harness.commands.push(CommandResult {
            exit_code: Some(2),
            stdout: "1 failed\n".to_string(),
            stderr: "AssertionError\n".to_string(),
            timed_out: false,
        });
        let result = harness
            .executor()
            .execute(&Step::run_command("test", "pytest"), "t")
            .await;
        assert!(result.is_failed());
        assert_eq!(result.error(), Some("AssertionError"));
        assert_eq!(result.output.as_deref(), Some("1 failed\n"));
        assert_eq!(result.result["exit_code"], 2);
    }

    #[tokio::test]
    async fn analyze_reports_summary_with_focus() {
        let harness = Harness::new();
        harness
            .fs
            .insert("lib.py", "import os\n\ndef helper(a, b):\n    return a\n");
        let result = harness
            .executor()
            .execute(&Step::analyze("review", "lib.py", Some("security")), "t")
            .await;
        assert_eq!(result.status(), StepStatus::Completed);
        let output = result.output.unwrap_or_default();
        assert!(output.contains("Focus: security"));
        assert!(output.contains("helper(a, b)"));
        assert!(harness.fs.writes().is_empty());
    }

    #[tokio::test]
    async fn analyze_of_unsupported_language_completes_with_note() {
        let harness = Harness::new();
        harness.fs.insert("README.md", "# hi\n");
        let result = harness
            .executor()
            .execute(&Step::analyze("read", "README.md", None), "t")
            .await;
        assert_eq!(result.status(), StepStatus::Completed);
        assert!(result.note.unwrap_or_default().contains("analysis unavailable"));
    }

    #[tokio::test]
    async fn quality_loop_replaces_weak_drafts() {
        let mut harness = Harness::new();
        harness.config.quality.max_rounds = 1;
        harness.model.push_text("x=1");
        harness.model.push(Ok(ModelReply::Json(serde_json::json!({
            "code_quality": 0.2, "test_coverage": 0.2, "performance": 0.2,
            "modularity": 0.2, "documentation": 0.2
        }))));
        harness.model.push_text("- name things");
        harness.model.push_text("count = 1\n");
        harness.model.push(Ok(ModelReply::Json(serde_json::json!({
            "code_quality": 0.9, "test_coverage": 0.9, "performance": 0.9,
            "modularity": 0.9, "documentation": 0.9
        }))));
        let result = harness
            .executor()
            .execute(&Step::generate("write", "a.py", "x"), "t")
            .await;
        assert_eq!(result.status(), StepStatus::Completed);
        assert_eq!(harness.fs.contents("a.py").as_deref(), Some("count = 1"));
        let keys = harness.store_keys("improvement:a.py:*").await;
        assert_eq!(keys.len(), 1);
    }
}
