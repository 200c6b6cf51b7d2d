//! Planner agent: task description in, [`PlanResponse`] out.

use std::sync::Arc;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::plan::{PlanError, PlanResponse};
use crate::io::model::{ModelClient, ModelError, generate_json};
use crate::io::prompt::{PlanningContext, PromptEngine};

const PLAN_RESPONSE_SCHEMA: &str = include_str!("../../schemas/plan_response.schema.json");

/// Why a model reply could not be read as a plan response.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reply does not match the plan response schema:\n- {}", .0.join("\n- "))]
    Schema(Vec<String>),
    #[error("decode plan response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Reply(#[from] DecodeError),
    #[error("planner returned an unusable plan: {0}")]
    Invalid(#[from] PlanError),
    #[error(transparent)]
    Prompt(#[from] anyhow::Error),
}

/// Compiled plan response schema (Draft 2020-12).
///
/// Shared by the planner and the refiner so both accept exactly the same shape.
pub struct PlanDecoder {
    validator: Validator,
}

impl PlanDecoder {
    pub fn new() -> Result<Self> {
        let schema: Value =
            serde_json::from_str(PLAN_RESPONSE_SCHEMA).context("parse plan response schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile plan response schema")?;
        Ok(Self { validator })
    }

    pub fn decode(&self, value: Value) -> Result<PlanResponse, DecodeError> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(DecodeError::Schema(messages));
        }
        Ok(serde_json::from_value(value)?)
    }
}

pub struct Planner {
    model: Arc<dyn ModelClient>,
    prompts: Arc<PromptEngine>,
    decoder: Arc<PlanDecoder>,
}

impl Planner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        prompts: Arc<PromptEngine>,
        decoder: Arc<PlanDecoder>,
    ) -> Self {
        Self {
            model,
            prompts,
            decoder,
        }
    }

    /// Ask the model for a plan.
    ///
    /// Malformed steps stay in the plan and fail when executed; the plan as a
    /// whole must still have an understanding and at least one usable step.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn plan(&self, task: &str, files: Vec<String>) -> Result<PlanResponse, PlanningError> {
        let prompt = self.prompts.planning(&PlanningContext {
            task: task.to_string(),
            files,
        })?;
        let value = generate_json(self.model.as_ref(), &prompt).await?;
        let response = self.decoder.decode(value)?;
        if let PlanResponse::Plan(plan) = &response {
            plan.validate()?;
            debug!(steps = plan.steps.len(), "received plan");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::model::{ModelReply, OutputHint};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedModel(Value);

    #[async_trait]
    impl ModelClient for FixedModel {
        async fn generate(&self, _prompt: &str, _hint: OutputHint) -> Result<ModelReply, ModelError> {
            Ok(ModelReply::Json(self.0.clone()))
        }
    }

    fn planner(reply: Value) -> Planner {
        Planner::new(
            Arc::new(FixedModel(reply)),
            Arc::new(PromptEngine::new().expect("prompts")),
            Arc::new(PlanDecoder::new().expect("schema")),
        )
    }

    #[tokio::test]
    async fn accepts_plans_with_legacy_step_names() {
        let planner = planner(json!({
            "kind": "plan",
            "understanding": "Create a script",
            "steps": [
                {"type": "code_generation", "description": "write", "file_path": "a.py", "requirements": "hi"},
                {"type": "terminal_command", "description": "run", "command": "python a.py"}
            ]
        }));
        let response = planner.plan("make a script", Vec::new()).await.expect("plan");
        let PlanResponse::Plan(plan) = response else {
            panic!("expected plan");
        };
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|step| step.validate().is_ok()));
    }

    #[tokio::test]
    async fn refusals_pass_through() {
        let planner = planner(json!({"kind": "refusal", "message": "Hello! What should I build?"}));
        let response = planner.plan("hi", Vec::new()).await.expect("refusal");
        assert_eq!(
            response,
            PlanResponse::Refusal {
                message: "Hello! What should I build?".to_string()
            }
        );
    }

    #[tokio::test]
    async fn schema_violations_are_reported() {
        let planner = planner(json!({"understanding": "no kind", "steps": []}));
        let err = planner.plan("t", Vec::new()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Reply(DecodeError::Schema(_))));
    }

    #[tokio::test]
    async fn empty_plans_are_rejected() {
        let planner = planner(json!({"kind": "plan", "understanding": "u", "steps": []}));
        let err = planner.plan("t", Vec::new()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Invalid(PlanError::NoSteps)));
    }

    #[tokio::test]
    async fn model_errors_propagate() {
        let planner = planner(json!({"error": "rate limited"}));
        let err = planner.plan("t", Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
    }
}
