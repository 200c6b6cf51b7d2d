//! Prompt rendering.
//!
//! Every prompt has a typed context struct, so the fields a template can use
//! are fixed at compile time.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

use crate::core::language::Language;
use crate::core::quality::QualityMetrics;
use crate::core::summary::ResultSummary;

const TEMPLATES: &[(&str, &str)] = &[
    ("plan", include_str!("prompts/plan.md")),
    ("refine", include_str!("prompts/refine.md")),
    ("generate", include_str!("prompts/generate.md")),
    ("modify", include_str!("prompts/modify.md")),
    ("quality_metrics", include_str!("prompts/quality_metrics.md")),
    ("improvement_plan", include_str!("prompts/improvement_plan.md")),
    ("refine_code", include_str!("prompts/refine_code.md")),
];

#[derive(Debug, Clone, Serialize)]
pub struct PlanningContext {
    pub task: String,
    /// Existing workspace files, so the planner knows what `modify` can target.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefinementContext {
    pub task: String,
    pub plan_json: String,
    pub results: Vec<ResultSummary>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationContext {
    pub task_summary: String,
    pub target_path: String,
    pub language: Language,
    pub step_description: String,
    pub requirements: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModificationContext {
    pub task_summary: String,
    pub target_path: String,
    pub language: Language,
    pub step_description: String,
    pub requirements: Option<String>,
    pub existing_code: String,
    /// Structural summary of the current file, when analysis succeeded.
    pub analysis: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityContext {
    pub target_path: String,
    pub language: Language,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImprovementPlanContext {
    pub target_path: String,
    pub language: Language,
    pub code: String,
    pub metrics: QualityMetrics,
    pub score: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefineCodeContext {
    pub target_path: String,
    pub language: Language,
    pub code: String,
    pub improvement_plan: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    pub fn planning(&self, ctx: &PlanningContext) -> Result<String> {
        self.render("plan", ctx)
    }

    pub fn refinement(&self, ctx: &RefinementContext) -> Result<String> {
        self.render("refine", ctx)
    }

    pub fn generation(&self, ctx: &GenerationContext) -> Result<String> {
        self.render("generate", ctx)
    }

    pub fn modification(&self, ctx: &ModificationContext) -> Result<String> {
        self.render("modify", ctx)
    }

    pub fn quality_metrics(&self, ctx: &QualityContext) -> Result<String> {
        self.render("quality_metrics", ctx)
    }

    pub fn improvement_plan(&self, ctx: &ImprovementPlanContext) -> Result<String> {
        self.render("improvement_plan", ctx)
    }

    pub fn refine_code(&self, ctx: &RefineCodeContext) -> Result<String> {
        self.render("refine_code", ctx)
    }

    fn render<S: Serialize>(&self, name: &str, ctx: &S) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("missing prompt template {name}"))?;
        template
            .render(ctx)
            .with_context(|| format!("render prompt {name}"))
    }
}
