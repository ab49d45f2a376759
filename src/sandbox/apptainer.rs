//! Apptainer/Singularity sandbox.
//!
//! The image is unpacked once into a writable sandbox directory; every
//! `execute` then runs `apptainer exec --writable <dir> bash -c ...` against
//! it, so filesystem changes (an applied patch) persist between calls while
//! host mounts and the host environment stay out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::process::run_with_timeout;
use super::{effective_cwd, sandbox_env, Environment, ExecutionOutcome};
use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// Sandbox backed by an unpacked image directory.
pub struct ApptainerSandbox {
    image: String,
    config: SandboxConfig,
    sandbox_dir: PathBuf,
    active: bool,
}

impl ApptainerSandbox {
    /// Builds a writable sandbox from `image`, retrying failed builds.
    pub async fn build(config: SandboxConfig, image: &str) -> Result<Self, SandboxError> {
        let executable = config.effective_executable().to_string();
        let source = container_source(image);
        let parent = config.sandbox_parent();
        tokio::fs::create_dir_all(&parent).await?;

        let attempts = config.build_retries.max(1);
        let mut last_output = String::new();
        for attempt in 1..=attempts {
            let sandbox_dir = parent.join(format!("swe-judge-{}", Uuid::new_v4().simple()));
            let mut command = Command::new(&executable);
            command
                .arg("build")
                .arg("--sandbox")
                .arg(&sandbox_dir)
                .arg(&source);

            debug!(image = %image, dir = %sandbox_dir.display(), attempt, "Building sandbox");
            let out = run_with_timeout(command, config.build_timeout())
                .await
                .map_err(|source| SandboxError::Spawn {
                    executable: executable.clone(),
                    source,
                })?;

            if out.return_code == 0 && !out.timed_out {
                info!(image = %image, dir = %sandbox_dir.display(), "Sandbox ready");
                return Ok(Self {
                    image: image.to_string(),
                    config,
                    sandbox_dir,
                    active: true,
                });
            }

            warn!(
                image = %image,
                attempt,
                attempts,
                return_code = out.return_code,
                timed_out = out.timed_out,
                "Sandbox build failed"
            );
            remove_sandbox_dir(&sandbox_dir).await;
            last_output = out.output;
        }

        Err(SandboxError::Build {
            image: image.to_string(),
            attempts,
            output: tail(&last_output, 2000),
        })
    }

    /// Directory holding the unpacked, writable image.
    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    /// Arguments passed to the container binary for one command.
    pub fn exec_args(&self, command: &str, cwd: Option<&str>) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        args.extend(self.config.effective_isolation_flags());

        if let Some(dir) = effective_cwd(cwd, &self.config) {
            args.push("--pwd".to_string());
            args.push(dir.to_string());
        }

        for (key, value) in sandbox_env(&self.config) {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.extend([
            "--writable".to_string(),
            self.sandbox_dir.to_string_lossy().to_string(),
            "bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Environment for ApptainerSandbox {
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

        debug!(image = %self.image, timeout_secs = timeout.as_secs(), command = %command, "Executing in sandbox");
        let out = run_with_timeout(process, timeout)
            .await
            .map_err(|source| SandboxError::Spawn {
                executable: executable.to_string(),
                source,
            })?;
        Ok(out.into())
    }

    async fn cleanup(&mut self) {
        if !self.active {
            return;
        }
        remove_sandbox_dir(&self.sandbox_dir).await;
        self.active = false;
    }
}

impl Drop for ApptainerSandbox {
    fn drop(&mut self) {
        if self.active {
            debug!(dir = %self.sandbox_dir.display(), "Sandbox dropped without cleanup, removing");
            let dir = std::mem::take(&mut self.sandbox_dir);
            // removing an unpacked image tree must not stall a runtime worker
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || {
                        let _ = std::fs::remove_dir_all(&dir);
                    });
                }
                Err(_) => {
                    let _ = std::fs::remove_dir_all(&dir);
                }
            }
        }
    }
}

/// `docker://` source for registry references; local images pass through.
fn container_source(image: &str) -> String {
    if image.contains("://") || image.ends_with(".sif") || Path::new(image).is_dir() {
        image.to_string()
    } else {
        format!("docker://{}", image)
    }
}

async fn remove_sandbox_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed sandbox"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove sandbox"),
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(config: SandboxConfig) -> ApptainerSandbox {
        ApptainerSandbox {
            image: "docker.io/swebench/sweb.eval.x86_64.foo_1776_bar:latest".to_string(),
            config,
            sandbox_dir: PathBuf::from("/tmp/swe-judge-test"),
            active: false,
        }
    }

    #[test]
    fn test_exec_args_layout() {
        let config = SandboxConfig::default()
            .with_cwd("/testbed")
            .with_env("PAGER", "cat");
        let args = sandbox(config).exec_args("git status", None);

        assert_eq!(
            args,
            vec![
                "exec",
                "--contain",
                "--cleanenv",
                "--no-mount",
                "hostfs",
                "--pwd",
                "/testbed",
                "--env",
                "PAGER=cat",
                "--writable",
                "/tmp/swe-judge-test",
                "bash",
                "-c",
                "git status",
            ]
        );
    }

    #[test]
    fn test_exec_args_root_cwd_not_passed() {
        let args = sandbox(SandboxConfig::default()).exec_args("ls", Some("/"));
        assert!(!args.contains(&"--pwd".to_string()));
    }

    #[test]
    fn test_exec_args_skip_unset_forwarded_vars() {
        let config = SandboxConfig::default().with_forward_env("SWE_JUDGE_SURELY_UNSET_VAR");
        let args = sandbox(config).exec_args("ls", None);
        assert!(!args.contains(&"--env".to_string()));
    }

    #[test]
    fn test_container_source() {
        assert_eq!(
            container_source("docker.io/swebench/x:latest"),
            "docker://docker.io/swebench/x:latest"
        );
        assert_eq!(container_source("oras://ghcr.io/x:1"), "oras://ghcr.io/x:1");
        assert_eq!(container_source("/images/x.sif"), "/images/x.sif");
    }

    #[test]
    fn test_tail_is_char_safe() {
        assert_eq!(tail("héllo wörld", 5), "wörld");
        assert_eq!(tail("ab", 5), "ab");
    }

    fn active_sandbox(dir: PathBuf) -> ApptainerSandbox {
        std::fs::create_dir_all(dir.join("usr/bin")).unwrap();
        std::fs::write(dir.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        ApptainerSandbox {
            image: "local".to_string(),
            config: SandboxConfig::default(),
            sandbox_dir: dir,
            active: true,
        }
    }

    #[test]
    fn test_drop_outside_runtime_removes_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path().join("sandbox");
        drop(active_sandbox(dir.clone()));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_removes_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path().join("sandbox");
        drop(active_sandbox(dir.clone()));

        for _ in 0..100 {
            if !dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!dir.exists());
    }
}
