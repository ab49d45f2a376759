//! Task instance records.
//!
//! Rows come from SWE-bench style datasets (JSONL exports, JSON arrays or
//! YAML). Only the columns the evaluator needs are typed; every other column
//! is kept in [`TaskInstance::extra`] so startup templates can reference it and
//! the candidate patch can be pulled out by field name.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

/// Default record field holding the candidate patch.
pub const DEFAULT_PATCH_FIELD: &str = "model_patch";

/// One task instance as read from a dataset row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Identifier, unique within its dataset family.
    pub instance_id: String,
    /// Dataset family name (e.g. `swe-smith`), when the row carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    /// Explicit image reference; bypasses the family naming scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// Complete test script, run verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_script: Option<String>,
    /// Test command provided by a dataset profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cmd: Option<String>,
    /// Test files that must fail before and pass after the fix.
    #[serde(
        default,
        rename = "FAIL_TO_PASS_FILES",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub fail_to_pass_files: Vec<String>,
    /// Test files that must keep passing.
    #[serde(
        default,
        rename = "PASS_TO_PASS_FILES",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub pass_to_pass_files: Vec<String>,
    /// Repository checkout inside the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Remaining dataset columns.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How the tests of an instance are invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCommand {
    /// A full script shipped with the instance.
    Script(String),
    /// A profile-derived command plus the graded test files to restore first.
    Profile {
        test_cmd: String,
        test_files: Vec<String>,
    },
}

impl TaskInstance {
    /// Creates an instance with only an identifier set.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Sets the literal test script.
    pub fn with_eval_script(mut self, script: impl Into<String>) -> Self {
        self.eval_script = Some(script.into());
        self
    }

    /// Sets a profile test command and its graded files.
    pub fn with_test_cmd(
        mut self,
        test_cmd: impl Into<String>,
        fail_to_pass: impl IntoIterator<Item = impl Into<String>>,
        pass_to_pass: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.test_cmd = Some(test_cmd.into());
        self.fail_to_pass_files = fail_to_pass.into_iter().map(Into::into).collect();
        self.pass_to_pass_files = pass_to_pass.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the sandbox working directory.
    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    /// The test invocation declared by this instance, if any.
    ///
    /// A literal `eval_script` wins over a profile `test_cmd`.
    pub fn test_command(&self) -> Option<TestCommand> {
        if let Some(script) = self.eval_script.as_ref().filter(|s| !s.trim().is_empty()) {
            return Some(TestCommand::Script(script.clone()));
        }
        let test_cmd = self.test_cmd.as_ref().filter(|s| !s.trim().is_empty())?;
        let mut test_files: Vec<String> = Vec::new();
        for file in self
            .fail_to_pass_files
            .iter()
            .chain(self.pass_to_pass_files.iter())
        {
            if !test_files.contains(file) {
                test_files.push(file.clone());
            }
        }
        Some(TestCommand::Profile {
            test_cmd: test_cmd.clone(),
            test_files,
        })
    }

    /// Reads a string column from the extra fields (e.g. the candidate patch).
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

/// Loads instances from a `.jsonl`, `.json` or `.yaml`/`.yml` file.
pub fn load_instances(path: &Path) -> Result<Vec<TaskInstance>, TaskError> {
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jsonl" | "ndjson" => parse_jsonl(&content),
        "json" => Ok(serde_json::from_str(&content)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
        other => Err(TaskError::UnsupportedFormat(other.to_string())),
    }
}

/// Parses one JSON record per line, skipping blank lines.
pub fn parse_jsonl(content: &str) -> Result<Vec<TaskInstance>, TaskError> {
    let mut instances = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let instance = serde_json::from_str(line).map_err(|source| TaskError::Parse {
            line: index + 1,
            source,
        })?;
        instances.push(instance);
    }
    Ok(instances)
}
