//! swe-judge: sandboxed evaluation of candidate patches for SWE task instances.
//!
//! A candidate patch is applied to a task's repository inside an isolated
//! container and the task's tests decide whether it resolves the issue.
//! Evaluations are independent and meant to run many at a time.

pub mod cli;
pub mod config;
pub mod error;
pub mod eval;
pub mod image;
pub mod sandbox;
pub mod task;

// Re-export commonly used types
pub use config::{EnvironmentKind, HarnessConfig, RunConfig, SandboxConfig};
pub use error::{
    ConfigError, EnvironmentCreationError, EnvironmentError, ImageError, SandboxError, TaskError,
};
pub use eval::{evaluate_batch, EvaluationJob, EvaluationResult, EvaluationSummary, Evaluator, FailureKind};
pub use image::{resolve_image_name, DatasetFamily};
pub use sandbox::{Environment, EnvironmentFactory, ExecutionOutcome};
pub use task::{TaskInstance, TestCommand};
