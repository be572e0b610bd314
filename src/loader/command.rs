//! External tool invocation for import loading.
//!
//! The `git:`, `s3:`, `ssm:` and `ssm-path:` schemes shell out to the system
//! `git` and `aws` executables rather than linking provider SDKs, so the
//! transform honours whatever credential configuration the operator already
//! has. [`ToolCommand`] is a small builder over [`tokio::process::Command`]
//! with captured output, a timeout, and consistent error context.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;

/// Default timeout for one external tool invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Builder for one external command invocation with captured output.
#[derive(Debug)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
    timeout_duration: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            timeout_duration: DEFAULT_TIMEOUT,
        }
    }

    /// A `git` invocation.
    pub fn git() -> Self {
        Self::new("git")
    }

    /// An `aws` CLI invocation.
    pub fn aws() -> Self {
        Self::new("aws")
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// Run the command and return its stdout as UTF-8.
    ///
    /// # Errors
    ///
    /// Fails when the executable cannot be spawned (commonly: not
    /// installed), when the command exits non-zero (stderr is included in
    /// the error), when it exceeds the timeout, or when stdout is not UTF-8.
    pub async fn output(self) -> Result<String> {
        tracing::debug!(
            target: "loader",
            "executing: {} {}",
            self.program,
            self.args.join(" ")
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let output = timeout(self.timeout_duration, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "'{}' timed out after {}s",
                    self.program,
                    self.timeout_duration.as_secs()
                )
            })?
            .with_context(|| format!("failed to execute '{}'; is it installed?", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'{} {}' exited with {}: {}",
                self.program,
                self.args.join(" "),
                output.status,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("'{}' produced non-UTF-8 output", self.program))
    }

    /// Run the command and return stdout with the trailing newline removed.
    ///
    /// This is the right call for single-value tools (`git rev-parse`,
    /// `aws --output text`) which always terminate their answer with `\n`.
    pub async fn output_trimmed(self) -> Result<String> {
        let out = self.output().await?;
        Ok(out.strip_suffix('\n').unwrap_or(&out).to_owned())
    }
}
