//! Bulk evaluation with bounded concurrency.
//!
//! Evaluations are independent, so the only limit is how many sandboxes the
//! host can hold at once. `parallel` bounds the number in flight.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::orchestrator::{EvaluationResult, Evaluator, FailureKind};
use crate::error::EnvironmentError;
use crate::sandbox::SandboxLauncher;
use crate::task::TaskInstance;

/// One patch to evaluate against one instance.
#[derive(Debug, Clone)]
pub struct EvaluationJob {
    pub instance: TaskInstance,
    pub patch: String,
    /// Image family used when the instance doesn't name its own.
    pub data_source: String,
}

impl EvaluationJob {
    pub fn new(instance: TaskInstance, patch: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            instance,
            patch: patch.into(),
            data_source: data_source.into(),
        }
    }
}

/// Summary of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total: usize,
    pub resolved: usize,
    pub patch_apply_failed: usize,
    pub test_failed: usize,
    pub timed_out: usize,
    pub env_failed: usize,
    pub infrastructure_failed: usize,
    pub invalid: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Results in job order.
    pub results: Vec<EvaluationResult>,
}

impl EvaluationSummary {
    fn from_results(
        results: Vec<EvaluationResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let count = |kind: FailureKind| {
            results
                .iter()
                .filter(|r| r.failure == Some(kind))
                .count()
        };

        Self {
            total: results.len(),
            resolved: results.iter().filter(|r| r.resolved).count(),
            patch_apply_failed: count(FailureKind::PatchApply),
            test_failed: count(FailureKind::TestFailure),
            timed_out: count(FailureKind::TestTimeout),
            env_failed: count(FailureKind::EnvironmentCreation),
            infrastructure_failed: count(FailureKind::Infrastructure),
            invalid: count(FailureKind::InvalidInstance),
            started_at,
            finished_at,
            results,
        }
    }

    /// Fraction of jobs resolved, 0.0 for an empty batch.
    pub fn resolve_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.resolved as f64 / self.total as f64
        }
    }
}

/// Evaluates `jobs` with at most `parallel` sandboxes alive at a time.
///
/// Per-instance failures land in the summary. A configuration error stops
/// the batch; in-flight evaluations are dropped, which kills their processes.
pub async fn evaluate_batch<L: SandboxLauncher>(
    evaluator: &Evaluator<L>,
    jobs: &[EvaluationJob],
    parallel: usize,
) -> Result<EvaluationSummary, EnvironmentError> {
    let started_at = Utc::now();
    let parallel = parallel.max(1);
    info!(jobs = jobs.len(), parallel, "Starting batch evaluation");

    let mut indexed: Vec<(usize, EvaluationResult)> = stream::iter(jobs.iter().enumerate())
        .map(|(index, job)| async move {
            evaluator
                .evaluate(&job.instance, &job.patch, &job.data_source)
                .await
                .map(|result| (index, result))
        })
        .buffer_unordered(parallel)
        .try_collect()
        .await?;
    indexed.sort_by_key(|(index, _)| *index);

    let results = indexed.into_iter().map(|(_, result)| result).collect();
    let summary = EvaluationSummary::from_results(results, started_at, Utc::now());
    info!(
        total = summary.total,
        resolved = summary.resolved,
        patch_apply_failed = summary.patch_apply_failed,
        test_failed = summary.test_failed,
        timed_out = summary.timed_out,
        env_failed = summary.env_failed,
        "Batch evaluation finished"
    );
    Ok(summary)
}
