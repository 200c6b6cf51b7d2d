//! Improvement loop: score a draft and ask for refinements until it clears
//! the quality threshold or the round budget runs out.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::language::Language;
use crate::core::quality::{ImprovementRecord, QualityMetrics};
use crate::io::model::{ModelClient, ModelError, generate_code, generate_json, generate_text};
use crate::io::prompt::{
    ImprovementPlanContext, PromptEngine, QualityContext, RefineCodeContext,
};

/// Final draft plus the record of how it got there.
#[derive(Debug, Clone, PartialEq)]
pub struct Improvement {
    pub code: String,
    /// `None` when the draft could not be scored at all.
    pub record: Option<ImprovementRecord>,
}

#[derive(Clone)]
pub struct Improver {
    model: Arc<dyn ModelClient>,
    prompts: Arc<PromptEngine>,
    threshold: f64,
    max_rounds: u32,
}

impl Improver {
    pub fn new(
        model: Arc<dyn ModelClient>,
        prompts: Arc<PromptEngine>,
        threshold: f64,
        max_rounds: u32,
    ) -> Self {
        Self {
            model,
            prompts,
            threshold,
            max_rounds,
        }
    }

    /// Never fails: any error ends the loop and the last scored draft wins.
    #[instrument(skip_all, fields(path = %path, max_rounds = self.max_rounds))]
    pub async fn improve(&self, path: &str, language: Language, draft: String) -> Improvement {
        let initial = match self.metrics(path, language, &draft).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not score draft; keeping it as is");
                return Improvement {
                    code: draft,
                    record: None,
                };
            }
        };

        let mut code = draft;
        let mut last = initial;
        let mut plans = Vec::new();
        let mut rounds = 0;
        while rounds < self.max_rounds && last.needs_improvement(self.threshold) {
            debug!(round = rounds + 1, score = last.score(), "improving draft");
            match self.round(path, language, &code, last).await {
                Ok((plan, refined, metrics)) => {
                    plans.push(plan);
                    code = refined;
                    last = metrics;
                    rounds += 1;
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "improvement round failed; keeping last draft");
                    break;
                }
            }
        }

        let record = ImprovementRecord {
            path: path.to_string(),
            initial,
            last,
            rounds,
            plans,
        };
        info!(
            rounds,
            initial = initial.score(),
            last = last.score(),
            "improvement loop finished"
        );
        Improvement {
            code,
            record: Some(record),
        }
    }

    async fn round(
        &self,
        path: &str,
        language: Language,
        code: &str,
        metrics: QualityMetrics,
    ) -> Result<(String, String, QualityMetrics)> {
        let prompt = self.prompts.improvement_plan(&ImprovementPlanContext {
            target_path: path.to_string(),
            language,
            code: code.to_string(),
            metrics,
            score: format!("{:.2}", metrics.score()),
            threshold: format!("{:.2}", self.threshold),
        })?;
        let plan = generate_text(self.model.as_ref(), &prompt)
            .await
            .context("request improvement plan")?;

        let prompt = self.prompts.refine_code(&RefineCodeContext {
            target_path: path.to_string(),
            language,
            code: code.to_string(),
            improvement_plan: plan.clone(),
        })?;
        let refined = generate_code(self.model.as_ref(), &prompt)
            .await
            .context("request improved code")?;
        let metrics = self.metrics(path, language, &refined).await?;
        Ok((plan, refined, metrics))
    }

    async fn metrics(&self, path: &str, language: Language, code: &str) -> Result<QualityMetrics> {
        let prompt = self.prompts.quality_metrics(&QualityContext {
            target_path: path.to_string(),
            language,
            code: code.to_string(),
        })?;
        let value = generate_json(self.model.as_ref(), &prompt)
            .await
            .context("request quality metrics")?;
        let metrics: QualityMetrics = serde_json::from_value(value)
            .map_err(|err| ModelError::Malformed(format!("quality metrics: {err}")))?;
        Ok(metrics.clamped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::model::{ModelReply, OutputHint};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct QueueModel(Mutex<VecDeque<Result<ModelReply, ModelError>>>);

    #[async_trait]
    impl ModelClient for QueueModel {
        async fn generate(&self, _prompt: &str, _hint: OutputHint) -> Result<ModelReply, ModelError> {
            self.0
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Unavailable("queue empty".to_string())))
        }
    }

    fn improver(replies: Vec<Result<ModelReply, ModelError>>, max_rounds: u32) -> Improver {
        Improver::new(
            Arc::new(QueueModel(Mutex::new(replies.into()))),
            Arc::new(PromptEngine::new().expect("prompts")),
            0.85,
            max_rounds,
        )
    }

    fn metrics(all: f64) -> Result<ModelReply, ModelError> {
        Ok(ModelReply::Json(json!({
            "code_quality": all,
            "test_coverage": all,
            "performance": all,
            "modularity": all,
            "documentation": all
        })))
    }

    fn text(reply: &str) -> Result<ModelReply, ModelError> {
        Ok(ModelReply::Text(reply.to_string()))
    }

    #[tokio::test]
    async fn good_drafts_are_left_alone() {
        let improver = improver(vec![metrics(0.9)], 3);
        let result = improver
            .improve("a.py", Language::Python, "x = 1".to_string())
            .await;
        assert_eq!(result.code, "x = 1");
        let record = result.record.expect("record");
        assert_eq!(record.rounds, 0);
        assert!(record.plans.is_empty());
    }

    #[tokio::test]
    async fn weak_drafts_are_refined_until_threshold() {
        let improver = improver(
            vec![
                metrics(0.5),
                text("- add docstring"),
                text("```python\n\"\"\"Doc.\"\"\"\nx = 1\n```"),
                metrics(0.9),
            ],
            3,
        );
        let result = improver
            .improve("a.py", Language::Python, "x = 1".to_string())
            .await;
        assert_eq!(result.code, "\"\"\"Doc.\"\"\"\nx = 1");
        let record = result.record.expect("record");
        assert_eq!(record.rounds, 1);
        assert_eq!(record.plans, vec!["- add docstring"]);
        assert!(record.improvement() > 0.3);
    }

    #[tokio::test]
    async fn failed_round_keeps_last_good_draft() {
        let improver = improver(
            vec![
                metrics(0.5),
                text("- split function"),
                Err(ModelError::Timeout(std::time::Duration::from_secs(1))),
            ],
            3,
        );
        let result = improver
            .improve("a.py", Language::Python, "x = 1".to_string())
            .await;
        assert_eq!(result.code, "x = 1");
        assert_eq!(result.record.expect("record").rounds, 0);
    }

    #[tokio::test]
    async fn unscorable_drafts_have_no_record() {
        let improver = improver(vec![text("not json")], 3);
        let result = improver
            .improve("a.py", Language::Python, "x = 1".to_string())
            .await;
        assert_eq!(result.code, "x = 1");
        assert_eq!(result.record, None);
    }
}
