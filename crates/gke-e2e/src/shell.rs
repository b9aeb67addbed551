//! External command execution.
//!
//! Every cluster and infrastructure operation in this crate is a call out to
//! `terraform`, `gcloud` or `kubectl`. Those calls go through the
//! [`CommandRunner`] trait so that the run can be driven by a scripted runner
//! in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{E2eError, Result};

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Binary name or path.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Working directory, if not the current one.
    pub working_dir: Option<PathBuf>,
}

impl ShellCommand {
    /// Start building a command for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the command from `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Whether the argument list contains `needle` as a contiguous run.
    #[must_use]
    pub fn has_args(&self, needle: &[&str]) -> bool {
        !needle.is_empty()
            && self
                .args
                .windows(needle.len())
                .any(|w| w.iter().zip(needle).all(|(a, b)| a == b))
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={value} ")?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status code.
    pub status_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Output with the given stdout and a zero exit code.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Executes external commands.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`E2eError::Spawn`] if the program cannot be started and
    /// [`E2eError::CommandFailed`] if it exits non-zero.
    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
        debug!(command = %command, "Running command");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).envs(&command.env).kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|source| E2eError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let status_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!(
                command = %command,
                status = status_code,
                stderr = %stderr.trim(),
                "Command failed"
            );
            return Err(E2eError::CommandFailed {
                command: command.to_string(),
                status: status_code,
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_env_and_args() {
        let cmd = ShellCommand::new("gcloud")
            .args(["beta", "container"])
            .env("KUBECONFIG", "/tmp/kc");
        assert_eq!(cmd.to_string(), "KUBECONFIG=/tmp/kc gcloud beta container");
    }

    #[test]
    fn test_has_args() {
        let cmd = ShellCommand::new("kubectl").args(["get", "service", "web", "-o", "json"]);
        assert!(cmd.has_args(&["service", "web"]));
        assert!(!cmd.has_args(&["web", "service"]));
        assert!(!cmd.has_args(&[]));
    }

    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let out = SystemRunner
            .run(&ShellCommand::new("sh").args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(out.status_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_reports_failure() {
        let err = SystemRunner
            .run(&ShellCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            E2eError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let err = SystemRunner
            .run(&ShellCommand::new("definitely-not-a-real-binary-4f2a"))
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_env_is_passed_to_child() {
        let out = SystemRunner
            .run(
                &ShellCommand::new("sh")
                    .args(["-c", "printf %s \"$KUBECONFIG\""])
                    .env("KUBECONFIG", "/tmp/isolated"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "/tmp/isolated");
    }
}
