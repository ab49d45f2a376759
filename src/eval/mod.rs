//! Patch evaluation pipeline.
//!
//! - [`patch`]: delivers a candidate patch into a sandbox with `git apply`
//! - [`test_runner`]: runs an instance's tests under the long timeout
//! - [`orchestrator`]: drives one evaluation end to end
//! - [`batch`]: evaluates many jobs with bounded concurrency

pub mod batch;
pub mod orchestrator;
pub mod patch;
pub mod test_runner;

pub use batch::{evaluate_batch, EvaluationJob, EvaluationSummary};
pub use orchestrator::{
    diagnostic_tail, resolve_work_dir, EvaluationResult, EvaluationStage, Evaluator, FailureKind,
    DIAGNOSTIC_TAIL_CHARS, TRUNCATION_PREFIX,
};
pub use patch::apply_patch;
pub use test_runner::{run_tests, TEST_OUTPUT_END, TEST_OUTPUT_START};
