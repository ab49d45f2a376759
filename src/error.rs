//! Error types for swe-judge operations.
//!
//! Defines error types for the evaluation subsystems:
//! - Image reference resolution
//! - Sandbox construction and command execution
//! - Environment creation and startup commands
//! - Task record and configuration loading
//!
//! Per-instance failures (patch application, failing tests, timeouts) are not
//! errors: they are recorded in an `EvaluationResult`. Only the variants for
//! which [`EnvironmentError::is_configuration_error`] holds are meant to stop
//! a caller.

use thiserror::Error;

/// Errors that can occur while resolving a container image reference.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Data source: {0} is not supported")]
    UnsupportedDatasetFamily(String),
}

/// Errors that can occur while building or driving a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox build for '{image}' failed after {attempts} attempt(s): {output}")]
    Build {
        image: String,
        attempts: u32,
        output: String,
    },

    #[error("Container start for '{image}' failed: {output}")]
    Start { image: String, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to construct or start a sandbox for an instance.
#[derive(Debug, Error)]
pub enum EnvironmentCreationError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Errors returned by the environment factory.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("{0}")]
    Creation(#[from] EnvironmentCreationError),

    #[error("Startup command template failed to render: {}", render_chain(.0))]
    StartupTemplate(#[source] tera::Error),

    #[error("Error executing startup command (return code {return_code}): {output}")]
    StartupCommand { return_code: i32, output: String },
}

impl EnvironmentError {
    /// True when the failure points at harness configuration rather than the
    /// instance being evaluated, so it applies to every instance alike.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            EnvironmentError::StartupTemplate(_) | EnvironmentError::StartupCommand { .. }
        )
    }
}

/// Errors that can occur while loading task instance records.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unsupported instance file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while loading the harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Tera hides the useful part of a render failure (e.g. the undefined
/// variable) in its source chain.
fn render_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors() {
        let startup = EnvironmentError::StartupCommand {
            return_code: 1,
            output: "boom".to_string(),
        };
        assert!(startup.is_configuration_error());

        let creation = EnvironmentError::Creation(EnvironmentCreationError::Image(
            ImageError::UnsupportedDatasetFamily("unknown".to_string()),
        ));
        assert!(!creation.is_configuration_error());
    }

    #[test]
    fn test_creation_message_is_transparent() {
        let err = EnvironmentError::from(EnvironmentCreationError::from(
            ImageError::UnsupportedDatasetFamily("unknown".to_string()),
        ));
        assert_eq!(err.to_string(), "Data source: unknown is not supported");
    }

    #[test]
    fn test_template_error_includes_cause() {
        let context = tera::Context::new();
        let err = tera::Tera::one_off("{{ missing_field }}", &context, false).unwrap_err();
        let message = EnvironmentError::StartupTemplate(err).to_string();
        assert!(message.contains("missing_field"), "got: {message}");
    }
}
