//! Agent configuration stored under `.coder/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::quality::DEFAULT_QUALITY_THRESHOLD;

/// Agent configuration (TOML).
///
/// Missing fields take the defaults below, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Process-wide cap on concurrent model calls.
    pub max_concurrent_model_calls: usize,

    /// Wall-clock limit for one `run_command` step.
    pub command_timeout_secs: u64,

    /// Truncate captured command stdout/stderr beyond this many bytes.
    pub command_output_limit_bytes: usize,

    /// Per-field byte limit for step results sent to the refiner.
    pub refine_output_limit_bytes: usize,

    /// Refinements allowed per task before a failure becomes final.
    pub max_refinements: u32,

    /// Expiry for persisted execution state; `None` keeps it forever.
    pub state_ttl_secs: Option<u64>,

    pub quality: QualityConfig,
    pub model: ModelConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    /// Weighted score below which generated code is sent back for improvement.
    pub threshold: f64,
    /// Improvement rounds per draft; 0 disables the loop.
    pub max_rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command that reads a prompt on stdin and prints the reply (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Context store directory, relative to the working directory.
    pub dir: String,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_QUALITY_THRESHOLD,
            max_rounds: 0,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: ".coder/store".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_model_calls: 5,
            command_timeout_secs: 600,
            command_output_limit_bytes: 100_000,
            refine_output_limit_bytes: 2_000,
            max_refinements: 3,
            state_ttl_secs: None,
            quality: QualityConfig::default(),
            model: ModelConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_model_calls == 0 {
            return Err(anyhow!("max_concurrent_model_calls must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.command_output_limit_bytes == 0 {
            return Err(anyhow!("command_output_limit_bytes must be > 0"));
        }
        if self.refine_output_limit_bytes == 0 {
            return Err(anyhow!("refine_output_limit_bytes must be > 0"));
        }
        if self.state_ttl_secs == Some(0) {
            return Err(anyhow!("state_ttl_secs must be > 0 when set"));
        }
        if !(0.0..=1.0).contains(&self.quality.threshold) {
            return Err(anyhow!("quality.threshold must be within 0.0..=1.0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        if self.store.dir.trim().is_empty() {
            return Err(anyhow!("store.dir must be non-empty"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn state_ttl(&self) -> Option<Duration> {
        self.state_ttl_secs.map(Duration::from_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
