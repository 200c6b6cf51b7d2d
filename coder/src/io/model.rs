//! Model inference client abstraction.
//!
//! The [`ModelClient`] trait decouples the agents from the inference backend.
//! The default backend pipes the prompt into an external model CLI; tests use
//! scripted clients that return queued replies without spawning processes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::core::reply::{error_payload, parse_json_reply, strip_code_fences};
use crate::io::process::{ProcessRequest, run_process};

/// What shape of reply the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputHint {
    Text,
    Json,
    Code,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    /// The provider answered with an `{"error": ...}` payload.
    #[error("{0}")]
    Provider(String),
    #[error("malformed model reply: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, prompt: &str, hint: OutputHint) -> Result<ModelReply, ModelError>;
}

/// Request code and return it with Markdown fences removed.
pub async fn generate_code(model: &dyn ModelClient, prompt: &str) -> Result<String, ModelError> {
    let code = match model.generate(prompt, OutputHint::Code).await? {
        ModelReply::Text(text) => {
            if let Some(message) = parse_json_reply(&text).as_ref().and_then(error_payload) {
                return Err(ModelError::Provider(message));
            }
            strip_code_fences(&text)
        }
        ModelReply::Json(value) => {
            if let Some(message) = error_payload(&value) {
                return Err(ModelError::Provider(message));
            }
            match value {
                Value::String(text) => strip_code_fences(&text),
                other => return Err(ModelError::Malformed(format!("expected code, got {other}"))),
            }
        }
    };
    if code.trim().is_empty() {
        return Err(ModelError::Malformed("empty code reply".to_string()));
    }
    Ok(code)
}

/// Request free text, such as an improvement plan.
pub async fn generate_text(model: &dyn ModelClient, prompt: &str) -> Result<String, ModelError> {
    let text = match model.generate(prompt, OutputHint::Text).await? {
        ModelReply::Text(text) => {
            if let Some(message) = parse_json_reply(&text).as_ref().and_then(error_payload) {
                return Err(ModelError::Provider(message));
            }
            text
        }
        ModelReply::Json(value) => match error_payload(&value) {
            Some(message) => return Err(ModelError::Provider(message)),
            None => value.to_string(),
        },
    };
    let text = text.trim();
    if text.is_empty() {
        return Err(ModelError::Malformed("empty reply".to_string()));
    }
    Ok(text.to_string())
}

/// Request a JSON value, rejecting error payloads and unparseable text.
pub async fn generate_json(model: &dyn ModelClient, prompt: &str) -> Result<Value, ModelError> {
    let value = match model.generate(prompt, OutputHint::Json).await? {
        ModelReply::Json(value) => value,
        ModelReply::Text(text) => parse_json_reply(&text)
            .ok_or_else(|| ModelError::Malformed("reply is not JSON".to_string()))?,
    };
    if let Some(message) = error_payload(&value) {
        return Err(ModelError::Provider(message));
    }
    Ok(value)
}

/// Caps how many model calls are in flight across every task sharing it.
///
/// Cloning shares the same permits.
#[derive(Clone)]
pub struct LimitedModel {
    inner: Arc<dyn ModelClient>,
    permits: Arc<Semaphore>,
}

impl LimitedModel {
    pub fn new(inner: Arc<dyn ModelClient>, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl ModelClient for LimitedModel {
    async fn generate(&self, prompt: &str, hint: OutputHint) -> Result<ModelReply, ModelError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ModelError::Unavailable("concurrency limiter closed".to_string()))?;
        self.inner.generate(prompt, hint).await
    }
}

/// Model client that runs an external CLI with the prompt on stdin and reads
/// the reply from stdout.
pub struct CommandModel {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[async_trait]
impl ModelClient for CommandModel {
    #[instrument(skip_all, fields(hint = ?hint, prompt_bytes = prompt.len()))]
    async fn generate(&self, prompt: &str, hint: OutputHint) -> Result<ModelReply, ModelError> {
        let request = ProcessRequest {
            argv: self.argv.clone(),
            cwd: self.workdir.clone(),
            stdin: Some(prompt.as_bytes().to_vec()),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        let output = run_process(request)
            .await
            .map_err(|err| ModelError::Unavailable(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "model command timed out");
            return Err(ModelError::Timeout(self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.exit_code(), "model command failed");
            let stderr = output.stderr_text();
            return Err(ModelError::Unavailable(format!(
                "model command exited with status {:?}: {}",
                output.exit_code(),
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(reply_bytes = text.len(), "model command completed");
        match hint {
            OutputHint::Json => parse_json_reply(&text)
                .map(ModelReply::Json)
                .ok_or_else(|| ModelError::Malformed("reply is not JSON".to_string())),
            OutputHint::Text | OutputHint::Code => Ok(ModelReply::Text(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedModel(ModelReply);

    #[async_trait]
    impl ModelClient for FixedModel {
        async fn generate(&self, _prompt: &str, _hint: OutputHint) -> Result<ModelReply, ModelError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn code_replies_are_unfenced() {
        let model = FixedModel(ModelReply::Text("```python\nprint(1)\n```".to_string()));
        assert_eq!(generate_code(&model, "p").await, Ok("print(1)".to_string()));
    }

    #[tokio::test]
    async fn error_payloads_surface_verbatim() {
        let model = FixedModel(ModelReply::Json(json!({"error": "quota exceeded"})));
        assert_eq!(
            generate_code(&model, "p").await,
            Err(ModelError::Provider("quota exceeded".to_string()))
        );
        assert_eq!(
            generate_json(&model, "p").await,
            Err(ModelError::Provider("quota exceeded".to_string()))
        );
        let text = FixedModel(ModelReply::Text("{\"error\": \"bad key\"}".to_string()));
        assert_eq!(
            generate_code(&text, "p").await,
            Err(ModelError::Provider("bad key".to_string()))
        );
    }

    #[tokio::test]
    async fn text_replies_are_trimmed_and_must_be_non_empty() {
        let model = FixedModel(ModelReply::Text("\n- add docstrings\n".to_string()));
        assert_eq!(
            generate_text(&model, "p").await,
            Ok("- add docstrings".to_string())
        );
        let blank = FixedModel(ModelReply::Text("  \n".to_string()));
        assert!(matches!(
            generate_text(&blank, "p").await,
            Err(ModelError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn non_json_text_is_malformed() {
        let model = FixedModel(ModelReply::Text("sure, here is a plan".to_string()));
        assert!(matches!(
            generate_json(&model, "p").await,
            Err(ModelError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn command_model_reads_stdout() {
        let model = CommandModel {
            argv: vec!["cat".to_string()],
            workdir: std::env::temp_dir(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let reply = model
            .generate("{\"kind\": \"refusal\"}", OutputHint::Json)
            .await
            .expect("reply");
        assert_eq!(reply, ModelReply::Json(json!({"kind": "refusal"})));
    }

    #[tokio::test]
    async fn command_model_reports_failures() {
        let model = CommandModel {
            argv: vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 2".to_string()],
            workdir: std::env::temp_dir(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let err = model.generate("p", OutputHint::Text).await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(msg) if msg.contains("nope")));
    }
}
