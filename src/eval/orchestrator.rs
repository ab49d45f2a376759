//! Per-instance evaluation.
//!
//! An evaluation walks a fixed sequence of stages and may stop early at any
//! of them:
//!
//! ```text
//! Created ──create──▶ EnvironmentReady ──apply──▶ PatchApplied ──test──▶ TestsRun ──▶ Done
//!    │                      │                          │
//!    └── env failure ───────┴── apply failure ─────────┴── spawn failure ──────────────▶ Done
//! ```
//!
//! Every stop is captured in an [`EvaluationResult`]. The only errors that
//! escape [`Evaluator::evaluate`] are configuration errors, which would fail
//! the same way for every instance.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::patch::apply_patch;
use super::test_runner::run_tests;
use crate::config::HarnessConfig;
use crate::error::{EnvironmentError, SandboxError};
use crate::sandbox::{ContainerLauncher, Environment, EnvironmentFactory, SandboxLauncher};
use crate::task::{TaskInstance, TestCommand};

/// Characters of test output kept in a failure diagnostic.
pub const DIAGNOSTIC_TAIL_CHARS: usize = 1000;

/// Marker heading every test-failure diagnostic.
pub const TRUNCATION_PREFIX: &str = "(truncated to last 1000 characters)\n";

/// Progress of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStage {
    Created,
    EnvironmentReady,
    PatchApplied,
    TestsRun,
    Done,
}

/// Why an evaluation did not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The instance carries no usable test command.
    InvalidInstance,
    /// Image resolution or sandbox launch failed.
    EnvironmentCreation,
    /// A command could not be started inside the sandbox.
    Infrastructure,
    PatchApply,
    TestFailure,
    TestTimeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InvalidInstance => "invalid_instance",
            FailureKind::EnvironmentCreation => "environment_creation",
            FailureKind::Infrastructure => "infrastructure",
            FailureKind::PatchApply => "patch_apply",
            FailureKind::TestFailure => "test_failure",
            FailureKind::TestTimeout => "test_timeout",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of evaluating one patch against one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub instance_id: String,
    pub resolved: bool,
    /// Diagnostic text; `None` exactly when `resolved` is true.
    pub eval_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl EvaluationResult {
    pub fn resolved(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            resolved: true,
            eval_error: None,
            failure: None,
            elapsed_ms: 0,
        }
    }

    pub fn failed(
        instance_id: impl Into<String>,
        failure: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            resolved: false,
            eval_error: Some(error.into()),
            failure: Some(failure),
            elapsed_ms: 0,
        }
    }

    fn with_elapsed(mut self, started: Instant) -> Self {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Bounded diagnostic built from the tail of the test output.
pub fn diagnostic_tail(output: &str) -> String {
    let count = output.chars().count();
    let tail: String = output
        .chars()
        .skip(count.saturating_sub(DIAGNOSTIC_TAIL_CHARS))
        .collect();
    format!("{}{}", TRUNCATION_PREFIX, tail)
}

/// Working directory for an instance's commands.
///
/// Instance setting first, then the run setting, then the sandbox default.
pub fn resolve_work_dir(config: &HarnessConfig, instance: &TaskInstance) -> String {
    [
        instance.work_dir.as_deref(),
        config.run.cwd.as_deref(),
        Some(config.environment.cwd.as_str()),
    ]
    .into_iter()
    .flatten()
    .find(|dir| !dir.trim().is_empty())
    .unwrap_or("/")
    .to_string()
}

/// Runs the full evaluation of a patch against an instance.
pub struct Evaluator<L = ContainerLauncher> {
    factory: EnvironmentFactory<L>,
    config: HarnessConfig,
}

impl Evaluator<ContainerLauncher> {
    /// Evaluator using the real container runtimes.
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            factory: EnvironmentFactory::new(),
            config,
        }
    }
}

impl<L: SandboxLauncher> Evaluator<L> {
    pub fn with_factory(factory: EnvironmentFactory<L>, config: HarnessConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn factory(&self) -> &EnvironmentFactory<L> {
        &self.factory
    }

    /// Evaluates `patch` against `instance` in a fresh sandbox.
    ///
    /// `data_source` picks the image family unless the instance names its
    /// own image. The sandbox is cleaned up before returning on every path.
    pub async fn evaluate(
        &self,
        instance: &TaskInstance,
        patch: &str,
        data_source: &str,
    ) -> Result<EvaluationResult, EnvironmentError> {
        let started = Instant::now();
        let instance_id = instance.instance_id.as_str();

        let Some(test) = instance.test_command() else {
            warn!(instance_id = %instance_id, "Instance has no test command");
            return Ok(EvaluationResult::failed(
                instance_id,
                FailureKind::InvalidInstance,
                "Instance has neither an eval script nor a test command",
            )
            .with_elapsed(started));
        };

        let mut env = match self.factory.create(&self.config, instance, data_source).await {
            Ok(env) => env,
            Err(e) if e.is_configuration_error() => return Err(e),
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Environment creation failed");
                return Ok(EvaluationResult::failed(
                    instance_id,
                    FailureKind::EnvironmentCreation,
                    format!("Env creation failed with {}", e),
                )
                .with_elapsed(started));
            }
        };
        let stage = advance(instance_id, EvaluationStage::Created, EvaluationStage::EnvironmentReady);

        let work_dir = resolve_work_dir(&self.config, instance);
        let result = self
            .run_stages(env.as_ref(), instance_id, patch, &test, &work_dir, stage)
            .await;
        env.cleanup().await;

        let result = result.with_elapsed(started);
        info!(
            instance_id = %instance_id,
            resolved = result.resolved,
            failure = ?result.failure,
            elapsed_ms = result.elapsed_ms,
            "Evaluation finished"
        );
        Ok(result)
    }

    async fn run_stages(
        &self,
        env: &dyn Environment,
        instance_id: &str,
        patch: &str,
        test: &TestCommand,
        work_dir: &str,
        mut stage: EvaluationStage,
    ) -> EvaluationResult {
        let applied = match apply_patch(env, patch, Some(work_dir)).await {
            Ok(outcome) => outcome,
            Err(e) => return infrastructure_failure(instance_id, stage, e),
        };
        if applied.return_code != 0 {
            debug!(instance_id = %instance_id, return_code = applied.return_code, "Patch did not apply");
            return EvaluationResult::failed(instance_id, FailureKind::PatchApply, applied.output);
        }
        stage = advance(instance_id, stage, EvaluationStage::PatchApplied);

        let tested = match run_tests(env, test, Some(work_dir), self.config.run.eval_timeout()).await
        {
            Ok(outcome) => outcome,
            Err(e) => return infrastructure_failure(instance_id, stage, e),
        };
        stage = advance(instance_id, stage, EvaluationStage::TestsRun);

        let result = if tested.return_code == 0 && !tested.timed_out {
            EvaluationResult::resolved(instance_id)
        } else {
            let failure = if tested.timed_out {
                FailureKind::TestTimeout
            } else {
                FailureKind::TestFailure
            };
            EvaluationResult::failed(instance_id, failure, diagnostic_tail(&tested.output))
        };
        advance(instance_id, stage, EvaluationStage::Done);
        result
    }
}

fn advance(instance_id: &str, from: EvaluationStage, to: EvaluationStage) -> EvaluationStage {
    debug!(instance_id = %instance_id, from = ?from, to = ?to, "Evaluation stage");
    to
}

fn infrastructure_failure(
    instance_id: &str,
    stage: EvaluationStage,
    error: SandboxError,
) -> EvaluationResult {
    warn!(instance_id = %instance_id, stage = ?stage, error = %error, "Sandbox command failed");
    EvaluationResult::failed(
        instance_id,
        FailureKind::Infrastructure,
        format!("Sandbox execution failed: {}", error),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::ExecutionOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// How the fake sandbox answers each kind of command.
    #[derive(Clone, Default)]
    struct Script {
        apply: Option<ExecutionOutcome>,
        test: Option<ExecutionOutcome>,
        fail_launch: bool,
        spawn_error_on_test: bool,
    }

    #[derive(Default)]
    struct Calls {
        launches: AtomicUsize,
        applies: AtomicUsize,
        tests: AtomicUsize,
        cleanups: AtomicUsize,
        cwds: Mutex<Vec<Option<String>>>,
        timeouts: Mutex<Vec<Option<Duration>>>,
    }

    struct FakeEnv {
        script: Script,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl Environment for FakeEnv {
        fn image(&self) -> &str {
            "fake"
        }

        async fn execute(
            &self,
            command: &str,
            cwd: Option<&str>,
            timeout: Option<Duration>,
        ) -> Result<ExecutionOutcome, SandboxError> {
            self.calls.cwds.lock().unwrap().push(cwd.map(str::to_string));
            self.calls.timeouts.lock().unwrap().push(timeout);
            if command.starts_with("git apply") {
                self.calls.applies.fetch_add(1, Ordering::SeqCst);
                return Ok(self.script.apply.clone().unwrap_or_else(|| ExecutionOutcome::new("", 0)));
            }
            self.calls.tests.fetch_add(1, Ordering::SeqCst);
            if self.script.spawn_error_on_test {
                return Err(SandboxError::Spawn {
                    executable: "apptainer".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            Ok(self.script.test.clone().unwrap_or_else(|| ExecutionOutcome::new("ok", 0)))
        }

        async fn cleanup(&mut self) {
            self.calls.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        script: Script,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl SandboxLauncher for FakeLauncher {
        async fn launch(
            &self,
            _config: &SandboxConfig,
            image: &str,
        ) -> Result<Box<dyn Environment>, SandboxError> {
            self.calls.launches.fetch_add(1, Ordering::SeqCst);
            if self.script.fail_launch {
                return Err(SandboxError::Start {
                    image: image.to_string(),
                    output: "pull access denied".to_string(),
                });
            }
            Ok(Box::new(FakeEnv {
                script: self.script.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    fn evaluator(script: Script) -> (Evaluator<FakeLauncher>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let launcher = FakeLauncher {
            script,
            calls: Arc::clone(&calls),
        };
        let config = HarnessConfig::default().with_eval_timeout(Duration::from_secs(3600));
        (
            Evaluator::with_factory(EnvironmentFactory::with_launcher(launcher), config),
            calls,
        )
    }

    fn instance() -> TaskInstance {
        TaskInstance::new("foo__bar")
            .with_eval_script("pytest")
            .with_work_dir("/testbed")
    }

    #[tokio::test]
    async fn test_resolved_when_tests_pass() {
        let (evaluator, calls) = evaluator(Script::default());
        let result = evaluator.evaluate(&instance(), "diff", "swe-bench").await.unwrap();

        assert!(result.resolved);
        assert_eq!(result.eval_error, None);
        assert_eq!(result.failure, None);
        assert_eq!(calls.applies.load(Ordering::SeqCst), 1);
        assert_eq!(calls.tests.load(Ordering::SeqCst), 1);
        assert_eq!(calls.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_patch_and_tests_use_their_own_timeouts() {
        let (evaluator, calls) = evaluator(Script::default());
        evaluator.evaluate(&instance(), "diff", "swe-bench").await.unwrap();

        let timeouts = calls.timeouts.lock().unwrap().clone();
        assert_eq!(timeouts, vec![None, Some(Duration::from_secs(3600))]);
        let cwds = calls.cwds.lock().unwrap().clone();
        assert!(cwds.iter().all(|c| c.as_deref() == Some("/testbed")));
    }

    #[tokio::test]
    async fn test_environment_failure_short_circuits() {
        let (evaluator, calls) = evaluator(Script {
            fail_launch: true,
            ..Default::default()
        });
        let result = evaluator.evaluate(&instance(), "diff", "swe-bench").await.unwrap();

        assert!(!result.resolved);
        assert_eq!(result.failure, Some(FailureKind::EnvironmentCreation));
        assert!(result
            .eval_error
            .as_deref()
            .unwrap()
            .starts_with("Env creation failed with "));
        assert_eq!(calls.applies.load(Ordering::SeqCst), 0);
        assert_eq!(calls.tests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_family_reported_as_env_failure() {
        let (evaluator, calls) = evaluator(Script::default());
        let result = evaluator.evaluate(&instance(), "diff", "unknown").await.unwrap();

        assert_eq!(result.failure, Some(FailureKind::EnvironmentCreation));
        assert_eq!(
            result.eval_error.as_deref(),
            Some("Env creation failed with Data source: unknown is not supported")
        );
        assert_eq!(calls.launches.load(Ordering::SeqCst), 0);
        assert_eq!(calls.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_patch_failure_keeps_raw_output() {
        let (evaluator, calls) = evaluator(Script {
            apply: Some(ExecutionOutcome::new("error: unrecognized input\n", 128)),
            ..Default::default()
        });
        let result = evaluator.evaluate(&instance(), "", "swe-smith").await.unwrap();

        assert!(!result.resolved);
        assert_eq!(result.failure, Some(FailureKind::PatchApply));
        assert_eq!(result.eval_error.as_deref(), Some("error: unrecognized input\n"));
        assert_eq!(calls.tests.load(Ordering::SeqCst), 0);
        assert_eq!(calls.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_diagnostic_is_bounded() {
        let noisy = format!("{}FAILED tests/test_x.py", "x".repeat(5000));
        let (evaluator, _) = evaluator(Script {
            test: Some(ExecutionOutcome::new(noisy, 1)),
            ..Default::default()
        });
        let result = evaluator.evaluate(&instance(), "diff", "swe-bench").await.unwrap();

        let error = result.eval_error.unwrap();
        assert_eq!(result.failure, Some(FailureKind::TestFailure));
        assert!(error.starts_with(TRUNCATION_PREFIX));
        assert!(error.ends_with("FAILED tests/test_x.py"));
        assert_eq!(
            error.chars().count(),
            TRUNCATION_PREFIX.chars().count() + DIAGNOSTIC_TAIL_CHARS
        );
    }

    #[tokio::test]
    async fn test_timeout_becomes_result() {
        let (evaluator, calls) = evaluator(Script {
            test: Some(ExecutionOutcome::timeout("collecting ...")),
            ..Default::default()
        });
        let result = evaluator.evaluate(&instance(), "diff", "swe-bench").await.unwrap();

        assert!(!result.resolved);
        assert_eq!(result.failure, Some(FailureKind::TestTimeout));
        assert_eq!(
            result.eval_error.as_deref(),
            Some("(truncated to last 1000 characters)\ncollecting ...")
        );
        assert_eq!(calls.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_infrastructure() {
        let (evaluator, calls) = evaluator(Script {
            spawn_error_on_test: true,
            ..Default::default()
        });
        let result = evaluator.evaluate(&instance(), "diff", "swe-bench").await.unwrap();

        assert_eq!(result.failure, Some(FailureKind::Infrastructure));
        assert!(!result.resolved);
        assert_eq!(calls.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_test_command_never_launches() {
        let (evaluator, calls) = evaluator(Script::default());
        let result = evaluator
            .evaluate(&TaskInstance::new("foo__bar"), "diff", "swe-bench")
            .await
            .unwrap();

        assert_eq!(result.failure, Some(FailureKind::InvalidInstance));
        assert_eq!(calls.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_startup_failure_propagates() {
        let calls = Arc::new(Calls::default());
        let launcher = FakeLauncher {
            script: Script {
                test: Some(ExecutionOutcome::new("no such commit", 1)),
                ..Default::default()
            },
            calls: Arc::clone(&calls),
        };
        let config = HarnessConfig::default().with_startup_command("git checkout {{ instance_id }}");
        let evaluator = Evaluator::with_factory(EnvironmentFactory::with_launcher(launcher), config);

        let err = evaluator
            .evaluate(&instance(), "diff", "swe-bench")
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration_error());
        assert_eq!(calls.applies.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_work_dir_precedence() {
        let config = HarnessConfig::default();
        assert_eq!(resolve_work_dir(&config, &TaskInstance::new("a")), "/");

        let config = config.with_run_cwd("/run");
        assert_eq!(resolve_work_dir(&config, &TaskInstance::new("a")), "/run");
        assert_eq!(
            resolve_work_dir(&config, &TaskInstance::new("a").with_work_dir("/testbed")),
            "/testbed"
        );
    }

    #[test]
    fn test_diagnostic_tail_short_output() {
        assert_eq!(diagnostic_tail("boom"), "(truncated to last 1000 characters)\nboom");
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::PatchApply).unwrap();
        assert_eq!(json, "\"patch_apply\"");
        assert_eq!(FailureKind::TestTimeout.to_string(), "test_timeout");
    }
}
