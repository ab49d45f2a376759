//! Harness configuration.
//!
//! Loaded from YAML; every key is optional. The `environment` section
//! describes how sandboxes are built and how commands run inside them, the
//! `run` section how an evaluation drives them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default per-command timeout (patch application, startup commands).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the test stage.
pub const DEFAULT_EVAL_TIMEOUT_SECS: u64 = 3600;

/// Container runtime used for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// Apptainer/Singularity with a writable sandbox directory.
    #[default]
    #[serde(alias = "singularity")]
    Apptainer,
    /// A long-lived Docker container driven through `docker exec`.
    Docker,
}

impl EnvironmentKind {
    /// Binary invoked when the config does not name one.
    pub fn default_executable(&self) -> &'static str {
        match self {
            EnvironmentKind::Apptainer => "apptainer",
            EnvironmentKind::Docker => "docker",
        }
    }

    /// Flags that keep host state out of the sandbox.
    pub fn default_isolation_flags(&self) -> Vec<String> {
        match self {
            // no host home/tmp binds, no inherited env, no hostfs mounts
            EnvironmentKind::Apptainer => ["--contain", "--cleanenv", "--no-mount", "hostfs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            // docker run starts with neither host mounts nor host env
            EnvironmentKind::Docker => Vec::new(),
        }
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentKind::Apptainer => write!(f, "apptainer"),
            EnvironmentKind::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "apptainer" | "singularity" => Ok(EnvironmentKind::Apptainer),
            "docker" => Ok(EnvironmentKind::Docker),
            other => Err(format!("Unknown environment kind: {}", other)),
        }
    }
}

/// Configuration for the sandbox environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Runtime variant.
    pub kind: EnvironmentKind,
    /// Container binary; defaults per kind.
    pub executable: Option<String>,
    /// Isolation flags; defaults per kind.
    pub isolation_flags: Option<Vec<String>>,
    /// Host variables copied into the sandbox when set.
    pub forward_env: Vec<String>,
    /// Literal variables, overriding forwarded ones.
    pub env: BTreeMap<String, String>,
    /// Default working directory. Empty or `/` means "not passed".
    pub cwd: String,
    /// Default per-command timeout in seconds.
    pub timeout_secs: u64,
    /// Parent directory for writable sandboxes; system temp dir when unset.
    pub sandbox_dir: Option<PathBuf>,
    /// Timeout for building a sandbox from its image.
    pub build_timeout_secs: u64,
    /// Attempts at building a sandbox before giving up.
    pub build_retries: u32,
}

impl SandboxConfig {
    /// Creates a sandbox configuration with defaults for the given kind.
    pub fn new(kind: EnvironmentKind) -> Self {
        Self {
            kind,
            executable: None,
            isolation_flags: None,
            forward_env: Vec::new(),
            env: BTreeMap::new(),
            cwd: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            sandbox_dir: None,
            build_timeout_secs: 1800,
            build_retries: 3,
        }
    }

    /// Sets the container binary.
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Replaces the isolation flags.
    pub fn with_isolation_flags(mut self, flags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.isolation_flags = Some(flags.into_iter().map(Into::into).collect());
        self
    }

    /// Allows a host variable into the sandbox.
    pub fn with_forward_env(mut self, name: impl Into<String>) -> Self {
        self.forward_env.push(name.into());
        self
    }

    /// Adds a literal environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the default working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Sets the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the parent directory for sandboxes.
    pub fn with_sandbox_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sandbox_dir = Some(dir.into());
        self
    }

    /// Container binary to invoke.
    pub fn effective_executable(&self) -> &str {
        self.executable
            .as_deref()
            .unwrap_or_else(|| self.kind.default_executable())
    }

    /// Isolation flags to pass.
    pub fn effective_isolation_flags(&self) -> Vec<String> {
        self.isolation_flags
            .clone()
            .unwrap_or_else(|| self.kind.default_isolation_flags())
    }

    /// Default per-command timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timeout for building a sandbox.
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Directory under which sandboxes are created.
    pub fn sandbox_parent(&self) -> PathBuf {
        self.sandbox_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(EnvironmentKind::default())
    }
}

/// How an evaluation drives its sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Working directory for patch application and tests.
    pub cwd: Option<String>,
    /// Timeout for the test stage.
    pub eval_timeout_secs: u64,
    /// Template run once after the sandbox starts, rendered with the
    /// instance's fields. Undefined fields are an error.
    pub env_startup_command: Option<String>,
}

impl RunConfig {
    /// Test stage timeout.
    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            eval_timeout_secs: DEFAULT_EVAL_TIMEOUT_SECS,
            env_startup_command: None,
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub environment: SandboxConfig,
    pub run: RunConfig,
}

impl HarnessConfig {
    /// Loads a configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: HarnessConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the startup command template.
    pub fn with_startup_command(mut self, template: impl Into<String>) -> Self {
        self.run.env_startup_command = Some(template.into());
        self
    }

    /// Sets the working directory used for patches and tests.
    pub fn with_run_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.run.cwd = Some(cwd.into());
        self
    }

    /// Sets the test stage timeout.
    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.run.eval_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Rejects values that would make every evaluation fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.timeout_secs == 0 {
            return Err(ConfigError::Invalid("environment.timeout_secs must be > 0".into()));
        }
        if self.run.eval_timeout_secs == 0 {
            return Err(ConfigError::Invalid("run.eval_timeout_secs must be > 0".into()));
        }
        if self.environment.build_retries == 0 {
            return Err(ConfigError::Invalid("environment.build_retries must be > 0".into()));
        }
        if self.environment.effective_executable().is_empty() {
            return Err(ConfigError::Invalid("environment.executable is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.kind, EnvironmentKind::Apptainer);
        assert_eq!(config.effective_executable(), "apptainer");
        assert_eq!(
            config.effective_isolation_flags(),
            vec!["--contain", "--cleanenv", "--no-mount", "hostfs"]
        );
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.build_retries, 3);
    }

    #[test]
    fn test_sandbox_config_builder() {
        let config = SandboxConfig::new(EnvironmentKind::Docker)
            .with_executable("/usr/local/bin/docker")
            .with_forward_env("HF_TOKEN")
            .with_env("PIP_NO_INPUT", "1")
            .with_cwd("/testbed")
            .with_timeout(Duration::from_secs(90));

        assert_eq!(config.effective_executable(), "/usr/local/bin/docker");
        assert!(config.effective_isolation_flags().is_empty());
        assert_eq!(config.forward_env, vec!["HF_TOKEN"]);
        assert_eq!(config.env.get("PIP_NO_INPUT").map(String::as_str), Some("1"));
        assert_eq!(config.cwd, "/testbed");
        assert_eq!(config.timeout_secs, 90);
    }

    #[test]
    fn test_run_config_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.run.eval_timeout(), Duration::from_secs(3600));
        assert!(config.run.env_startup_command.is_none());
        assert!(config.run.eval_timeout() > config.environment.timeout());
    }

    #[test]
    fn test_load_yaml_partial() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harness.yaml");
        std::fs::write(
            &path,
            "environment:\n  kind: singularity\n  forward_env: [HF_TOKEN]\n  env:\n    LANG: C.UTF-8\n  cwd: /testbed\nrun:\n  env_startup_command: \"git checkout {{ instance_id }}\"\n",
        )
        .unwrap();

        let config = HarnessConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.environment.kind, EnvironmentKind::Apptainer);
        assert_eq!(config.environment.forward_env, vec!["HF_TOKEN"]);
        assert_eq!(config.environment.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.run.eval_timeout_secs, DEFAULT_EVAL_TIMEOUT_SECS);
        assert_eq!(
            config.run.env_startup_command.as_deref(),
            Some("git checkout {{ instance_id }}")
        );
    }

    #[test]
    fn test_load_yaml_rejects_zero_timeout() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harness.yaml");
        std::fs::write(&path, "run:\n  eval_timeout_secs: 0\n").unwrap();
        assert!(matches!(
            HarnessConfig::from_yaml_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_environment_kind_parse() {
        assert_eq!("Docker".parse::<EnvironmentKind>().unwrap(), EnvironmentKind::Docker);
        assert_eq!(
            "singularity".parse::<EnvironmentKind>().unwrap(),
            EnvironmentKind::Apptainer
        );
        assert!("podman".parse::<EnvironmentKind>().is_err());
    }
}
