//! Step model and kind-specific validation.
//!
//! A [`Step`] is kept in the loose shape the planner produced so that a plan
//! with one malformed step still loads; [`Step::validate`] turns it into a
//! typed [`StepAction`] and must succeed before any side effect runs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of step kinds. Unrecognized kinds are preserved so validation can
/// report them instead of the whole plan failing to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[serde(alias = "code_generation")]
    Generate,
    #[serde(alias = "code_modification")]
    Modify,
    #[serde(alias = "terminal_command")]
    RunCommand,
    #[serde(alias = "code_analysis")]
    Analyze,
    #[serde(untagged)]
    Unknown(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Generate => "generate",
            Self::Modify => "modify",
            Self::RunCommand => "run_command",
            Self::Analyze => "analyze",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(alias = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Generation/modification requirements, or the focus of an analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

/// Validated, kind-specific view of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction<'a> {
    Generate {
        file_path: &'a str,
        requirements: Option<&'a str>,
    },
    Modify {
        file_path: &'a str,
        requirements: Option<&'a str>,
    },
    RunCommand {
        command: &'a str,
    },
    Analyze {
        file_path: &'a str,
        focus: &'a str,
    },
}

impl StepAction<'_> {
    /// File path the action targets, if any.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::Generate { file_path, .. }
            | Self::Modify { file_path, .. }
            | Self::Analyze { file_path, .. } => Some(file_path),
            Self::RunCommand { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepValidationError {
    #[error("unrecognized step kind '{0}'")]
    UnknownKind(String),
    #[error("step is missing a description")]
    MissingDescription,
    #[error("{0} step requires a file_path")]
    MissingFilePath(&'static str),
    #[error("run_command step requires a command")]
    MissingCommand,
}

pub const DEFAULT_ANALYSIS_FOCUS: &str = "general";

impl Step {
    pub fn generate(description: &str, file_path: &str, requirements: &str) -> Self {
        Self {
            file_path: Some(file_path.to_string()),
            requirements: Some(requirements.to_string()),
            ..Self::bare(StepKind::Generate, description)
        }
    }

    pub fn modify(description: &str, file_path: &str, requirements: &str) -> Self {
        Self {
            file_path: Some(file_path.to_string()),
            requirements: Some(requirements.to_string()),
            ..Self::bare(StepKind::Modify, description)
        }
    }

    pub fn run_command(description: &str, command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::bare(StepKind::RunCommand, description)
        }
    }

    pub fn analyze(description: &str, file_path: &str, focus: Option<&str>) -> Self {
        Self {
            file_path: Some(file_path.to_string()),
            requirements: focus.map(str::to_string),
            ..Self::bare(StepKind::Analyze, description)
        }
    }

    /// A step of `kind` with only a description; kind-specific fields unset.
    pub fn bare(kind: StepKind, description: &str) -> Self {
        Self {
            kind,
            description: description.to_string(),
            file_path: None,
            requirements: None,
            command: None,
            expected_result: None,
            params: BTreeMap::new(),
        }
    }

    /// Check the kind-specific required fields.
    ///
    /// Pure and idempotent; safe to call speculatively.
    pub fn validate(&self) -> Result<StepAction<'_>, StepValidationError> {
        if self.description.trim().is_empty() {
            return Err(StepValidationError::MissingDescription);
        }

        let requirements = non_blank(self.requirements.as_deref());
        match &self.kind {
            StepKind::Generate => Ok(StepAction::Generate {
                file_path: self.required_path("generate")?,
                requirements,
            }),
            StepKind::Modify => Ok(StepAction::Modify {
                file_path: self.required_path("modify")?,
                requirements,
            }),
            StepKind::RunCommand => {
                let command = non_blank(self.command.as_deref())
                    .ok_or(StepValidationError::MissingCommand)?;
                Ok(StepAction::RunCommand { command })
            }
            StepKind::Analyze => Ok(StepAction::Analyze {
                file_path: self.required_path("analyze")?,
                focus: requirements.unwrap_or(DEFAULT_ANALYSIS_FOCUS),
            }),
            StepKind::Unknown(raw) => Err(StepValidationError::UnknownKind(raw.clone())),
        }
    }

    /// Non-fatal shape problems worth logging.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.kind {
            StepKind::Generate | StepKind::Modify
                if non_blank(self.requirements.as_deref()).is_none() =>
            {
                warnings.push(format!("{} step has no requirements", self.kind));
            }
            StepKind::RunCommand if self.file_path.is_some() => {
                warnings.push("run_command step ignores file_path".to_string());
            }
            _ => {}
        }
        warnings
    }

    fn required_path(&self, kind: &'static str) -> Result<&str, StepValidationError> {
        non_blank(self.file_path.as_deref()).ok_or(StepValidationError::MissingFilePath(kind))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
