//! Thin wrapper over the `terraform` CLI.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::errors::{InfraError, ProcessError};
use crate::process::{CommandOutput, CommandSpec};

/// Saved plan file name inside a working directory.
pub const PLAN_FILE: &str = "tfplan";

#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
    timeout: Duration,
}

impl TerraformCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn exec(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput, ProcessError> {
        debug!(dir = %dir.display(), args = ?args, "terraform");
        CommandSpec::new(&self.binary)
            .args(args.iter().copied())
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .timeout(self.timeout)
            .run()
            .await
    }

    /// Run a step, turning a non-zero exit into [`InfraError::CommandFailed`].
    async fn step(&self, dir: &Path, step: &str, args: &[&str]) -> Result<CommandOutput, InfraError> {
        let output = self.exec(dir, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(InfraError::CommandFailed {
                step: step.to_string(),
                code: output.code,
                detail: output.diagnostic(2000),
            })
        }
    }

    pub async fn init(&self, dir: &Path) -> Result<CommandOutput, InfraError> {
        self.step(dir, "init", &["init", "-input=false", "-no-color"])
            .await
    }

    pub async fn plan(&self, dir: &Path) -> Result<CommandOutput, InfraError> {
        let out = format!("-out={}", PLAN_FILE);
        self.step(dir, "plan", &["plan", "-input=false", "-no-color", &out])
            .await
    }

    pub async fn apply_plan(&self, dir: &Path) -> Result<CommandOutput, InfraError> {
        self.step(
            dir,
            "apply",
            &["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE],
        )
        .await
    }

    pub async fn destroy(&self, dir: &Path) -> Result<CommandOutput, InfraError> {
        self.step(
            dir,
            "destroy",
            &["destroy", "-input=false", "-no-color", "-auto-approve"],
        )
        .await
    }

    /// Resource addresses tracked in the state of `dir`.
    pub async fn state_list(&self, dir: &Path) -> Result<Vec<String>, InfraError> {
        let output = self.step(dir, "state list", &["state", "list"]).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Raw `terraform output -json` document.
    pub async fn output_json(&self, dir: &Path) -> Result<serde_json::Value, InfraError> {
        let output = self.step(dir, "output", &["output", "-json", "-no-color"]).await?;
        let trimmed = output.stdout.trim();
        if trimmed.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(trimmed).map_err(InfraError::OutputParse)
    }
}

/// Whether an init failure means the directory holds no configuration.
pub fn is_missing_configuration(err: &InfraError) -> bool {
    match err {
        InfraError::CommandFailed { detail, .. } => {
            let lower = detail.to_lowercase();
            lower.contains("no configuration files")
                || lower.contains("empty directory")
                || lower.contains("terraform initialized in an empty directory")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    #[cfg(unix)]
    fn fake_terraform(dir: &Path, script_body: &str) -> String {
        let path = dir.join("terraform");
        fs::write(&path, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_list_splits_lines() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_terraform(dir.path(), "printf 'aws_s3_bucket.site\\n\\naws_ecr_repository.api\\n'");
        let tf = TerraformCli::new(bin, Duration::from_secs(5));
        let list = tf.state_list(dir.path()).await.unwrap();
        assert_eq!(list, vec!["aws_s3_bucket.site", "aws_ecr_repository.api"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_becomes_command_failed() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_terraform(
            dir.path(),
            "echo 'Error: No configuration files' >&2; exit 1",
        );
        let tf = TerraformCli::new(bin, Duration::from_secs(5));
        let err = tf.init(dir.path()).await.unwrap_err();
        match &err {
            InfraError::CommandFailed { step, code, .. } => {
                assert_eq!(step, "init");
                assert_eq!(*code, Some(1));
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
        assert!(is_missing_configuration(&err));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_json_empty_stdout_is_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_terraform(dir.path(), "exit 0");
        let tf = TerraformCli::new(bin, Duration::from_secs(5));
        let value = tf.output_json(dir.path()).await.unwrap();
        assert!(value.as_object().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_json_garbage_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_terraform(dir.path(), "echo not-json");
        let tf = TerraformCli::new(bin, Duration::from_secs(5));
        assert!(matches!(
            tf.output_json(dir.path()).await,
            Err(InfraError::OutputParse(_))
        ));
    }

    #[test]
    fn test_other_failures_are_not_missing_configuration() {
        let err = InfraError::CommandFailed {
            step: "init".into(),
            code: Some(1),
            detail: "Error: Failed to query available provider packages".into(),
        };
        assert!(!is_missing_configuration(&err));
    }
}
