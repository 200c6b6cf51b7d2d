//! Code agent: drafts new files and rewrites existing ones.

use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::io::model::{ModelClient, ModelError, generate_code};
use crate::io::prompt::{GenerationContext, ModificationContext, PromptEngine};

#[derive(Debug, Error)]
pub enum CodeError {
    /// Surfaced verbatim in the step result.
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Prompt(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct CodeAgent {
    model: Arc<dyn ModelClient>,
    prompts: Arc<PromptEngine>,
}

impl CodeAgent {
    pub fn new(model: Arc<dyn ModelClient>, prompts: Arc<PromptEngine>) -> Self {
        Self { model, prompts }
    }

    #[instrument(skip_all, fields(path = %ctx.target_path))]
    pub async fn generate(&self, ctx: &GenerationContext) -> Result<String, CodeError> {
        let prompt = self.prompts.generation(ctx)?;
        Ok(generate_code(self.model.as_ref(), &prompt).await?)
    }

    #[instrument(skip_all, fields(path = %ctx.target_path))]
    pub async fn modify(&self, ctx: &ModificationContext) -> Result<String, CodeError> {
        let prompt = self.prompts.modification(ctx)?;
        Ok(generate_code(self.model.as_ref(), &prompt).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::language::Language;
    use crate::io::model::{ModelReply, OutputHint};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoModel {
        reply: Result<ModelReply, ModelError>,
        prompts: Mutex<Vec<(String, OutputHint)>>,
    }

    #[async_trait]
    impl ModelClient for EchoModel {
        async fn generate(&self, prompt: &str, hint: OutputHint) -> Result<ModelReply, ModelError> {
            self.prompts
                .lock()
                .expect("lock")
                .push((prompt.to_string(), hint));
            self.reply.clone()
        }
    }

    fn agent(reply: Result<ModelReply, ModelError>) -> (CodeAgent, Arc<EchoModel>) {
        let model = Arc::new(EchoModel {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        let agent = CodeAgent::new(model.clone(), Arc::new(PromptEngine::new().expect("prompts")));
        (agent, model)
    }

    #[tokio::test]
    async fn modification_prompt_includes_existing_code() {
        let (agent, model) = agent(Ok(ModelReply::Text(
            "```python\ndef f():\n    return 2\n```".to_string(),
        )));
        let code = agent
            .modify(&ModificationContext {
                task_summary: "bump".to_string(),
                target_path: "m.py".to_string(),
                language: Language::Python,
                step_description: "return 2".to_string(),
                requirements: Some("return 2 instead of 1".to_string()),
                existing_code: "def f():\n    return 1\n".to_string(),
                analysis: Some("Functions (1):\n  - f()".to_string()),
            })
            .await
            .expect("code");
        assert_eq!(code, "def f():\n    return 2");

        let prompts = model.prompts.lock().expect("lock");
        let (prompt, hint) = &prompts[0];
        assert_eq!(*hint, OutputHint::Code);
        assert!(prompt.contains("return 1"));
        assert!(prompt.contains("return 2 instead of 1"));
        assert!(prompt.contains("- f()"));
    }

    #[tokio::test]
    async fn model_errors_keep_their_message() {
        let (agent, _) = agent(Err(ModelError::Provider("context length exceeded".to_string())));
        let err = agent
            .generate(&GenerationContext {
                task_summary: "t".to_string(),
                target_path: "a.py".to_string(),
                language: Language::Python,
                step_description: "s".to_string(),
                requirements: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "context length exceeded");
    }
}
