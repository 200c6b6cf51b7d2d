//! Plan model and the planner's structured response contract.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::step::Step;

/// Ordered work order produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Restatement of the task goal. Only checked for presence.
    pub understanding: String,
    /// Advisory manifest of paths the plan expects to touch.
    #[serde(default)]
    pub files: BTreeSet<String>,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

/// Either a plan or a conversational reply for input that needs no plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanResponse {
    Plan(Plan),
    Refusal { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan is missing an understanding")]
    MissingUnderstanding,
    #[error("plan has no steps")]
    NoSteps,
    #[error("plan has no well-formed steps: {}", .0.join("; "))]
    NoValidSteps(Vec<String>),
}

impl Plan {
    pub fn new(understanding: &str, steps: Vec<Step>) -> Self {
        let files = steps
            .iter()
            .filter_map(|step| step.file_path.clone())
            .collect();
        Self {
            understanding: understanding.to_string(),
            files,
            steps,
        }
    }

    /// A plan is executable when it has an understanding and at least one
    /// well-formed step. Malformed steps are left in place; they fail when
    /// executed.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.understanding.trim().is_empty() {
            return Err(PlanError::MissingUnderstanding);
        }
        if self.steps.is_empty() {
            return Err(PlanError::NoSteps);
        }
        let errors = self.step_errors();
        if errors.len() == self.steps.len() {
            return Err(PlanError::NoValidSteps(errors));
        }
        Ok(())
    }

    /// Drop malformed steps, then validate what is left.
    ///
    /// Returns the number of steps dropped.
    pub fn retain_valid_steps(&mut self) -> Result<usize, PlanError> {
        let errors = self.step_errors();
        let before = self.steps.len();
        self.steps.retain(|step| {
            let valid = step.validate().is_ok();
            if !valid {
                warn!(kind = %step.kind, description = %step.description, "dropping malformed step");
            }
            valid
        });
        let dropped = before - self.steps.len();
        if before > 0 && self.steps.is_empty() {
            return Err(PlanError::NoValidSteps(errors));
        }
        self.validate()?;
        Ok(dropped)
    }

    fn step_errors(&self) -> Vec<String> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| {
                step.validate()
                    .err()
                    .map(|err| format!("step {index}: {err}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::StepKind;
    use serde_json::json;

    fn broken_step() -> Step {
        Step::bare(StepKind::Generate, "no path")
    }

    #[test]
    fn zero_step_plan_is_invalid() {
        let plan = Plan::new("build app", Vec::new());
        assert_eq!(plan.validate(), Err(PlanError::NoSteps));
    }

    #[test]
    fn plan_with_only_malformed_steps_is_invalid() {
        let plan = Plan::new("build app", vec![broken_step()]);
        assert!(matches!(plan.validate(), Err(PlanError::NoValidSteps(_))));
    }

    #[test]
    fn retain_valid_steps_filters_and_reports() {
        let mut plan = Plan::new(
            "build app",
            vec![broken_step(), Step::run_command("list", "ls")],
        );
        assert_eq!(plan.retain_valid_steps(), Ok(1));
        assert_eq!(plan.steps.len(), 1);

        let mut empty = Plan::new("build app", vec![broken_step()]);
        assert!(matches!(
            empty.retain_valid_steps(),
            Err(PlanError::NoValidSteps(_))
        ));
    }

    #[test]
    fn plan_response_is_tagged() {
        let refusal: PlanResponse =
            serde_json::from_value(json!({"kind": "refusal", "message": "hello!"}))
                .expect("refusal");
        assert_eq!(
            refusal,
            PlanResponse::Refusal {
                message: "hello!".to_string()
            }
        );

        let plan: PlanResponse = serde_json::from_value(json!({
            "kind": "plan",
            "understanding": "create app",
            "files": ["app/main.py"],
            "steps": [{
                "kind": "generate",
                "description": "write main",
                "file_path": "app/main.py",
                "requirements": "print hello"
            }]
        }))
        .expect("plan");
        let PlanResponse::Plan(plan) = plan else {
            panic!("expected plan");
        };
        assert_eq!(plan.steps[0].kind, StepKind::Generate);
        assert!(plan.files.contains("app/main.py"));
    }
}
