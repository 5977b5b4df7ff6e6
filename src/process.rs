//! External command execution.
//!
//! Every tool Shipyard shells out to (terraform, npm, python, docker, the
//! code fixer) goes through [`CommandSpec::run`]: the child is spawned with
//! `kill_on_drop`, bounded by a timeout, and its output captured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::ProcessError;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr when present, stdout otherwise, trimmed to the last `max` chars.
    pub fn diagnostic(&self, max: usize) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        tail(text, max)
    }

    /// stdout and stderr joined, for log capture.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Last `max` characters of `text`, prefixed with an ellipsis when cut.
pub fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max).collect();
    format!("...{}", skipped)
}

/// A command to run with a working directory, environment and deadline.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: BTreeMap::new(),
            stdin: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Run `command` through `sh -c`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable rendering used in errors and logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Spawn, feed stdin, and wait for completion within the deadline.
    ///
    /// A non-zero exit is not an error here; callers inspect
    /// [`CommandOutput::success`]. Hitting the deadline drops the child,
    /// which kills it.
    pub async fn run(&self) -> Result<CommandOutput, ProcessError> {
        let rendered = self.display();
        debug!(command = %rendered, dir = ?self.dir, "running command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            // A child that exits without reading stdin closes the pipe; not fatal.
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!(command = %rendered, error = %e, "stdin write failed");
            }
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ProcessError::Wait {
                command: rendered.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ProcessError::Timeout {
                    command: rendered,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };
        debug!(
            command = %rendered,
            code = ?result.code,
            elapsed_ms = result.duration.as_millis() as u64,
            "command finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout_and_exit_code() {
        let out = CommandSpec::shell("echo hello; echo oops >&2; exit 3")
            .run()
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.diagnostic(100), "oops");
        assert_eq!(out.combined(), "hello\noops");
    }

    #[tokio::test]
    async fn test_run_passes_stdin_env_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = CommandSpec::shell("cat; printf \" $GREETING \"; pwd")
            .stdin("{\"a\":1}")
            .env("GREETING", "hi")
            .current_dir(dir.path())
            .run()
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.starts_with("{\"a\":1} hi "));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.trim_end().ends_with(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let err = CommandSpec::shell("sleep 5")
            .timeout(Duration::from_millis(100))
            .run()
            .await
            .unwrap_err();
        match err {
            ProcessError::Timeout { command, .. } => assert_eq!(command, "sh -c sleep 5"),
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = CommandSpec::new("/nonexistent/definitely-not-a-binary")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_tail_truncates_from_the_front() {
        assert_eq!(tail("abcdef", 10), "abcdef");
        assert_eq!(tail("abcdef", 3), "...def");
    }

    #[test]
    fn test_display() {
        let spec = CommandSpec::new("terraform").args(["plan", "-out=tfplan"]);
        assert_eq!(spec.display(), "terraform plan -out=tfplan");
    }
}
