//! Interactive console: shows plans and results, asks for decisions.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use similar::TextDiff;
use tracing::warn;

use crate::core::plan::Plan;
use crate::core::step::Step;
use crate::core::types::StepResult;

/// Three-way decision on a code draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditDecision {
    /// Write the draft as is.
    Confirm,
    /// Write the draft, let the user edit it, then use the edited file.
    Edit,
    /// Discard the draft; the step is skipped.
    Cancel,
}

#[async_trait]
pub trait Console: Send + Sync {
    async fn show_plan(&self, plan: &Plan);

    async fn show_step(&self, index: usize, total: usize, step: &Step);

    async fn show_result(&self, index: usize, result: &StepResult);

    async fn show_message(&self, message: &str);

    /// Yes/no question. `default` is used for empty or unreadable input.
    async fn confirm(&self, question: &str, default: bool) -> bool;

    /// Show a draft (as a diff when `previous` is given) and ask what to do.
    async fn review_code(&self, path: &str, previous: Option<&str>, draft: &str) -> EditDecision;

    /// Block until the user says the manual edit of `path` is done.
    async fn wait_for_manual_edit(&self, path: &str);
}

/// Unified diff of `previous` against `draft` for display.
pub fn render_diff(path: &str, previous: &str, draft: &str) -> String {
    TextDiff::from_lines(previous, draft)
        .unified_diff()
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Console on the process's stdin/stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConsole;

impl TerminalConsole {
    async fn ask(&self, prompt: String) -> Option<String> {
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            write!(stdout, "{prompt}").ok()?;
            stdout.flush().ok()?;
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim().to_string()),
            }
        })
        .await;
        match answer {
            Ok(answer) => answer,
            Err(err) => {
                warn!(err = %err, "console input task failed");
                None
            }
        }
    }
}

#[async_trait]
impl Console for TerminalConsole {
    async fn show_plan(&self, plan: &Plan) {
        let mut out = format!("\nPlan: {}\n", plan.understanding.trim());
        if !plan.files.is_empty() {
            out.push_str("Files:\n");
            for file in &plan.files {
                out.push_str(&format!("  - {file}\n"));
            }
        }
        out.push_str("Steps:\n");
        for (index, step) in plan.steps.iter().enumerate() {
            out.push_str(&format!("  {}. [{}] {}\n", index + 1, step.kind, step.description));
        }
        println!("{out}");
    }

    async fn show_step(&self, index: usize, total: usize, step: &Step) {
        let target = step
            .file_path
            .as_deref()
            .or(step.command.as_deref())
            .unwrap_or_default();
        println!(
            "\n==> Step {}/{} [{}] {} {}",
            index + 1,
            total,
            step.kind,
            step.description,
            target
        );
    }

    async fn show_result(&self, index: usize, result: &StepResult) {
        let mut line = format!("<== Step {} {}", index + 1, result.status().as_str());
        if let Some(file) = &result.file {
            line.push_str(&format!(" ({file})"));
        }
        if let Some(error) = result.error() {
            line.push_str(&format!(": {error}"));
        }
        if let Some(note) = &result.note {
            line.push_str(&format!(" [{note}]"));
        }
        println!("{line}");
        if let Some(output) = result.output.as_deref().filter(|o| !o.trim().is_empty()) {
            println!("{}", output.trim_end());
        }
    }

    async fn show_message(&self, message: &str) {
        println!("{message}");
    }

    async fn confirm(&self, question: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let Some(answer) = self.ask(format!("{question} {hint} ")).await else {
                return default;
            };
            match answer.to_ascii_lowercase().as_str() {
                "" => return default,
                "y" | "yes" => return true,
                "n" | "no" => return false,
                _ => println!("Please answer y or n."),
            }
        }
    }

    async fn review_code(&self, path: &str, previous: Option<&str>, draft: &str) -> EditDecision {
        match previous {
            Some(previous) => println!("{}", render_diff(path, previous, draft)),
            None => println!("--- {path} (new file) ---\n{draft}\n--- end ---"),
        }
        loop {
            let Some(answer) = self
                .ask("Apply this code? [c]onfirm / [e]dit / [x] cancel: ".to_string())
                .await
            else {
                return EditDecision::Cancel;
            };
            match answer.to_ascii_lowercase().as_str() {
                "" | "c" | "confirm" => return EditDecision::Confirm,
                "e" | "edit" => return EditDecision::Edit,
                "x" | "cancel" => return EditDecision::Cancel,
                _ => println!("Please answer c, e or x."),
            }
        }
    }

    async fn wait_for_manual_edit(&self, path: &str) {
        let _ = self
            .ask(format!("Edit {path} now, then press Enter to continue... "))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_shows_changed_lines() {
        let diff = render_diff("app.py", "a = 1\nb = 2\n", "a = 1\nb = 3\n");
        assert!(diff.contains("--- a/app.py"));
        assert!(diff.contains("-b = 2"));
        assert!(diff.contains("+b = 3"));
    }
}
