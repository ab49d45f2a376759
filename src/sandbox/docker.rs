//! Docker sandbox.
//!
//! A detached container (`sleep infinity`) is started once per evaluation and
//! commands run through `docker exec`. No volumes are mounted and only the
//! assembled variables are passed, so the host filesystem and environment
//! stay out.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::process::run_with_timeout;
use super::{effective_cwd, sandbox_env, Environment, ExecutionOutcome};
use crate::config::SandboxConfig;
use crate::error::SandboxError;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Sandbox backed by a long-lived container.
pub struct DockerSandbox {
    image: String,
    config: SandboxConfig,
    container_name: String,
    active: bool,
}

impl DockerSandbox {
    /// Starts a detached container for `image`.
    pub async fn start(config: SandboxConfig, image: &str) -> Result<Self, SandboxError> {
        let container_name = format!("swe-judge-{}", Uuid::new_v4().simple());
        let executable = config.effective_executable().to_string();
        let args = run_args(&config, &container_name, image);

        let mut command = Command::new(&executable);
        command.args(&args);
        debug!(image = %image, container = %container_name, "Starting container");

        // image pulls can take as long as an apptainer build
        let out = run_with_timeout(command, config.build_timeout())
            .await
            .map_err(|source| SandboxError::Spawn {
                executable: executable.clone(),
                source,
            })?;

        if out.return_code != 0 || out.timed_out {
            // a timed-out `docker run -d` may still have created the container
            remove_container(&executable, &container_name).await;
            return Err(SandboxError::Start {
                image: image.to_string(),
                output: out.output.trim().to_string(),
            });
        }

        info!(image = %image, container = %container_name, "Container ready");
        Ok(Self {
            image: image.to_string(),
            config,
            container_name,
            active: true,
        })
    }

    /// Name of the backing container.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Arguments passed to the container binary for one command.
    pub fn exec_args(&self, command: &str, cwd: Option<&str>) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(dir) = effective_cwd(cwd, &self.config) {
            args.push("-w".to_string());
            args.push(dir.to_string());
        }
        args.extend([
            self.container_name.clone(),
            "bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        args
    }
}

/// `docker run` arguments: detached, no mounts, assembled env only.
fn run_args(config: &SandboxConfig, container_name: &str, image: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];
    args.extend(config.effective_isolation_flags());
    for (key, value) in sandbox_env(config) {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend([
        image.to_string(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]);
    args
}

async fn remove_container(executable: &str, container_name: &str) {
    let mut command = Command::new(executable);
    command.args(["rm", "-f", container_name]);
    match run_with_timeout(command, CONTROL_TIMEOUT).await {
        Ok(out) if out.return_code == 0 => debug!(container = %container_name, "Removed container"),
        Ok(out) => {
            debug!(container = %container_name, output = %out.output.trim(), "Container removal returned non-zero (may not exist)")
        }
        Err(e) => warn!(container = %container_name, error = %e, "Failed to remove container"),
    }
}

#[async_trait]
impl Environment for DockerSandbox {
    fn image(&self) -> &str {
        &self.image
    }

    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let executable = self.config.effective_executable();
        let timeout = timeout.unwrap_or_else(|| self.config.timeout());

        let mut process = Command::new(executable);
        process.args(self.exec_args(command, cwd));

        debug!(container = %self.container_name, timeout_secs = timeout.as_secs(), command = %command, "Executing in container");
        let out = run_with_timeout(process, timeout)
            .await
            .map_err(|source| SandboxError::Spawn {
                executable: executable.to_string(),
                source,
            })?;

        if out.timed_out {
            // killing the exec client leaves the command running in the container
            warn!(container = %self.container_name, "Command timed out, killing container");
            let mut kill = Command::new(executable);
            kill.args(["kill", self.container_name.as_str()]);
            if let Err(e) = run_with_timeout(kill, CONTROL_TIMEOUT).await {
                warn!(container = %self.container_name, error = %e, "Failed to kill container");
            }
        }
        Ok(out.into())
    }

    async fn cleanup(&mut self) {
        if !self.active {
            return;
        }
        remove_container(self.config.effective_executable(), &self.container_name).await;
        self.active = false;
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.active {
            warn!(container = %self.container_name, "Container was not cleaned up properly, removing");
            let _ = std::process::Command::new(self.config.effective_executable())
                .args(["rm", "-f", self.container_name.as_str()])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
        }
    }
}
