//! Refiner agent: revise a plan after a step failed.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::agents::planner::{DecodeError, PlanDecoder};
use crate::core::plan::{Plan, PlanError, PlanResponse};
use crate::core::summary::summarize_results;
use crate::core::types::StepResult;
use crate::io::model::{ModelClient, ModelError, generate_json};
use crate::io::prompt::{PromptEngine, RefinementContext};

#[derive(Debug, Error)]
pub enum RefineError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Reply(#[from] DecodeError),
    #[error("refined plan is unusable: {0}")]
    Invalid(#[from] PlanError),
    #[error("serialize current plan: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Prompt(#[from] anyhow::Error),
}

pub struct Refiner {
    model: Arc<dyn ModelClient>,
    prompts: Arc<PromptEngine>,
    decoder: Arc<PlanDecoder>,
    /// Byte limit for each text field of a step result in the request.
    output_limit_bytes: usize,
}

impl Refiner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        prompts: Arc<PromptEngine>,
        decoder: Arc<PlanDecoder>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            model,
            prompts,
            decoder,
            output_limit_bytes,
        }
    }

    /// Ask for a replacement plan given what has happened so far.
    ///
    /// Malformed steps in the revision are dropped; a revision left with no
    /// usable step is an error rather than an empty plan.
    #[instrument(skip_all, fields(results = results.len()))]
    pub async fn refine(
        &self,
        task: &str,
        plan: &Plan,
        results: &BTreeMap<usize, StepResult>,
        feedback: Option<&str>,
    ) -> Result<PlanResponse, RefineError> {
        let prompt = self.prompts.refinement(&RefinementContext {
            task: task.to_string(),
            plan_json: serde_json::to_string_pretty(plan)?,
            results: summarize_results(results, self.output_limit_bytes),
            feedback: feedback.map(str::to_string),
        })?;
        let value = generate_json(self.model.as_ref(), &prompt).await?;
        let mut response = self.decoder.decode(value)?;
        if let PlanResponse::Plan(revised) = &mut response {
            let dropped = revised.retain_valid_steps()?;
            info!(steps = revised.steps.len(), dropped, "received refined plan");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::Step;
    use crate::io::model::{ModelReply, OutputHint};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct CapturingModel {
        reply: Value,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelClient for CapturingModel {
        async fn generate(&self, prompt: &str, _hint: OutputHint) -> Result<ModelReply, ModelError> {
            self.prompts.lock().expect("lock").push(prompt.to_string());
            Ok(ModelReply::Json(self.reply.clone()))
        }
    }

    fn refiner(reply: Value, limit: usize) -> (Refiner, Arc<CapturingModel>) {
        let model = Arc::new(CapturingModel {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        let refiner = Refiner::new(
            model.clone(),
            Arc::new(PromptEngine::new().expect("prompts")),
            Arc::new(PlanDecoder::new().expect("schema")),
            limit,
        );
        (refiner, model)
    }

    fn failing_run() -> (Plan, BTreeMap<usize, StepResult>) {
        let plan = Plan::new("u", vec![Step::run_command("test", "pytest")]);
        let mut results = BTreeMap::new();
        results.insert(
            0,
            StepResult::failed("E".repeat(500)).with_output("collected 0 items"),
        );
        (plan, results)
    }

    #[tokio::test]
    async fn drops_malformed_steps_from_revision() {
        let (refiner, _) = refiner(
            json!({
                "kind": "plan",
                "understanding": "retry",
                "steps": [
                    {"kind": "generate", "description": "no path"},
                    {"kind": "run_command", "description": "test", "command": "pytest -q"}
                ]
            }),
            100,
        );
        let (plan, results) = failing_run();
        let response = refiner
            .refine("t", &plan, &results, None)
            .await
            .expect("refined");
        let PlanResponse::Plan(revised) = response else {
            panic!("expected plan");
        };
        assert_eq!(revised.steps, vec![Step::run_command("test", "pytest -q")]);
    }

    #[tokio::test]
    async fn revision_without_valid_steps_is_a_failure() {
        let (refiner, _) = refiner(
            json!({
                "kind": "plan",
                "understanding": "retry",
                "steps": [{"kind": "modify", "description": "no path"}]
            }),
            100,
        );
        let (plan, results) = failing_run();
        let err = refiner.refine("t", &plan, &results, None).await.unwrap_err();
        assert!(matches!(err, RefineError::Invalid(PlanError::NoValidSteps(_))));
    }

    #[tokio::test]
    async fn request_carries_bounded_results_and_feedback() {
        let (refiner, model) = refiner(json!({"kind": "refusal", "message": "cannot"}), 100);
        let (plan, results) = failing_run();
        refiner
            .refine("t", &plan, &results, Some("use unittest"))
            .await
            .expect("refusal");
        let prompts = model.prompts.lock().expect("lock");
        assert!(prompts[0].contains("[truncated 400 bytes]"));
        assert!(prompts[0].contains("collected 0 items"));
        assert!(prompts[0].contains("use unittest"));
        assert!(prompts[0].contains("\"command\": \"pytest\""));
    }
}
