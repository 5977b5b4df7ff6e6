//! Code fixer collaborator used by the sandbox build loop.
//!
//! A fixer receives build diagnostics and may edit files under the project
//! directory. The [`CommandFixer`] hands the request to an external command
//! as JSON on stdin and reads an optional JSON [`FixOutcome`] from stdout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::process::CommandSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    pub project_id: String,
    pub project_dir: PathBuf,
    /// `frontend` or `backend`.
    pub side: String,
    pub round: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixOutcome {
    pub applied: bool,
    pub files_changed: Vec<String>,
    pub summary: Option<String>,
}

#[async_trait]
pub trait CodeFixer: Send + Sync {
    async fn fix(&self, request: &FixRequest) -> Result<FixOutcome>;
}

/// Never changes anything.
pub struct NoopFixer;

#[async_trait]
impl CodeFixer for NoopFixer {
    async fn fix(&self, _request: &FixRequest) -> Result<FixOutcome> {
        Ok(FixOutcome::default())
    }
}

/// Runs a shell command in the project directory with the request on stdin.
///
/// Exit code 0 means a fix was attempted. Stdout, when it parses as a
/// [`FixOutcome`], refines the result.
pub struct CommandFixer {
    command: String,
    timeout: Duration,
}

impl CommandFixer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeFixer for CommandFixer {
    async fn fix(&self, request: &FixRequest) -> Result<FixOutcome> {
        let payload = serde_json::to_string(request).context("Failed to serialize fix request")?;
        info!(
            project_id = %request.project_id,
            side = %request.side,
            round = request.round,
            "invoking code fixer"
        );

        let output = CommandSpec::shell(&self.command)
            .current_dir(&request.project_dir)
            .env("SHIPYARD_PROJECT_ID", &request.project_id)
            .env("SHIPYARD_FIX_SIDE", &request.side)
            .stdin(payload)
            .timeout(self.timeout)
            .run()
            .await
            .with_context(|| format!("Code fixer `{}` did not complete", self.command))?;

        if !output.success() {
            warn!(code = ?output.code, "code fixer exited unsuccessfully");
            return Ok(FixOutcome {
                applied: false,
                files_changed: Vec::new(),
                summary: Some(output.diagnostic(500)),
            });
        }

        let stdout = output.stdout.trim();
        if let Ok(outcome) = serde_json::from_str::<FixOutcome>(stdout) {
            return Ok(outcome);
        }
        Ok(FixOutcome {
            applied: true,
            files_changed: Vec::new(),
            summary: (!stdout.is_empty()).then(|| stdout.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(dir: &std::path::Path) -> FixRequest {
        FixRequest {
            project_id: "p1".into(),
            project_dir: dir.to_path_buf(),
            side: "backend".into(),
            round: 1,
            errors: vec!["SyntaxError: Unexpected token".into()],
        }
    }

    #[tokio::test]
    async fn test_noop_fixer_applies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = NoopFixer.fix(&request(dir.path())).await.unwrap();
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn test_command_fixer_receives_json_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = CommandFixer::new(
            "cat > request.json; echo '{\"applied\":true,\"filesChanged\":[\"server.js\"]}'",
            Duration::from_secs(5),
        );
        let outcome = fixer.fix(&request(dir.path())).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.files_changed, vec!["server.js".to_string()]);

        let written = fs::read_to_string(dir.path().join("request.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["side"], "backend");
        assert_eq!(parsed["errors"][0], "SyntaxError: Unexpected token");
    }

    #[tokio::test]
    async fn test_command_fixer_plain_stdout_counts_as_applied() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = CommandFixer::new("echo patched things", Duration::from_secs(5));
        let outcome = fixer.fix(&request(dir.path())).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.summary.as_deref(), Some("patched things"));
    }

    #[tokio::test]
    async fn test_command_fixer_nonzero_exit_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = CommandFixer::new("echo cannot fix >&2; exit 1", Duration::from_secs(5));
        let outcome = fixer.fix(&request(dir.path())).await.unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.summary.as_deref(), Some("cannot fix"));
    }
}
