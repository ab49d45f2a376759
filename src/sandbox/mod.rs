//! Sandboxed command execution.
//!
//! An [`Environment`] is bound to one image for its whole life. It is created
//! per evaluation, used for any number of [`Environment::execute`] calls, then
//! cleaned up. The runtime variant is picked by
//! [`EnvironmentKind`](crate::config::EnvironmentKind):
//!
//! ```text
//! SandboxConfig.kind ─┬─ apptainer → ApptainerSandbox (writable sandbox dir)
//!                     └─ docker    → DockerSandbox    (long-lived container)
//! ```

pub mod apptainer;
pub mod docker;
pub mod factory;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

pub use apptainer::ApptainerSandbox;
pub use docker::DockerSandbox;
pub use factory::{ContainerLauncher, EnvironmentFactory, SandboxLauncher};
pub use process::TIMEOUT_RETURN_CODE;

/// Result of one command run inside a sandbox.
///
/// stdout and stderr are merged; the split is not preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: String,
    pub return_code: i32,
    /// The command hit its timeout and was killed.
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecutionOutcome {
    /// Creates an outcome for a command that ran to completion.
    pub fn new(output: impl Into<String>, return_code: i32) -> Self {
        Self {
            output: output.into(),
            return_code,
            timed_out: false,
        }
    }

    /// Creates an outcome for a command killed at its deadline.
    pub fn timeout(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            return_code: TIMEOUT_RETURN_CODE,
            timed_out: true,
        }
    }

    /// True when the command exited with code zero.
    pub fn is_success(&self) -> bool {
        self.return_code == 0 && !self.timed_out
    }
}

impl From<process::ProcessOutput> for ExecutionOutcome {
    fn from(out: process::ProcessOutput) -> Self {
        Self {
            output: out.output,
            return_code: out.return_code,
            timed_out: out.timed_out,
        }
    }
}

/// A sandbox bound to one image.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Image reference this sandbox was created from.
    fn image(&self) -> &str;

    /// Runs `bash -c <command>` inside the sandbox.
    ///
    /// `cwd` and `timeout` fall back to the sandbox configuration. Non-zero
    /// exits and timeouts are reported in the outcome; `Err` means the
    /// container binary itself could not be run.
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome, SandboxError>;

    /// Releases everything the sandbox holds. Safe to call more than once.
    async fn cleanup(&mut self) {}
}

/// Variables visible inside the sandbox: allow-listed host variables that
/// are currently set, overlaid by the literal config variables.
pub fn sandbox_env(config: &SandboxConfig) -> Vec<(String, String)> {
    sandbox_env_from(config, |key| std::env::var(key).ok())
}

/// [`sandbox_env`] with an injectable host lookup.
pub fn sandbox_env_from<F>(config: &SandboxConfig, host: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut vars: Vec<(String, String)> = Vec::new();
    for key in &config.forward_env {
        if config.env.contains_key(key) || vars.iter().any(|(k, _)| k == key) {
            continue;
        }
        if let Some(value) = host(key) {
            vars.push((key.clone(), value));
        }
    }
    for (key, value) in &config.env {
        vars.push((key.clone(), value.clone()));
    }
    vars
}

/// Working directory to pass to the runtime, if any.
///
/// The filesystem root is the runtime default and is never passed.
pub fn effective_cwd<'a>(cwd: Option<&'a str>, config: &'a SandboxConfig) -> Option<&'a str> {
    let dir = cwd.filter(|d| !d.is_empty()).unwrap_or(config.cwd.as_str());
    if dir.is_empty() || dir == "/" {
        None
    } else {
        Some(dir)
    }
}
