//! Shell command execution for `run_command` steps.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::io::process::{ProcessRequest, run_process};

/// Outcome of a shell command. A non-zero exit is a normal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in `cwd`. Errors only when the command could not be run.
    async fn run(&self, command: &str, cwd: &Path) -> Result<CommandResult>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[async_trait]
impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(cwd = %cwd.display()))]
    async fn run(&self, command: &str, cwd: &Path) -> Result<CommandResult> {
        info!(command, "running shell command");
        let output = run_process(ProcessRequest {
            argv: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            cwd: cwd.to_path_buf(),
            stdin: None,
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })
        .await?;
        Ok(CommandResult {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_zero_exit_is_a_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellRunner {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1000,
        };
        let result = runner
            .run("echo hi; echo oops >&2; exit 1", temp.path())
            .await
            .expect("run");
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "oops\n");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn plain_exit_leaves_stderr_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellRunner {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1000,
        };
        let result = runner.run("exit 1", temp.path()).await.expect("run");
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let runner = ShellRunner {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1000,
        };
        let result = runner.run("ls", temp.path()).await.expect("run");
        assert!(result.success());
        assert!(result.stdout.contains("marker.txt"));
    }
}
