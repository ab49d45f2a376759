//! Test execution inside a sandbox.
//!
//! Profile commands are wrapped in a generated script that marks where test
//! output starts and ends, records the command's exit status and exits with
//! it. Literal instance scripts run as shipped. Either way the script goes to
//! `bash` through a quoted heredoc and runs with the long test timeout.

use std::time::Duration;

use tracing::{debug, warn};

use super::patch::heredoc_delimiter;
use crate::error::SandboxError;
use crate::sandbox::{Environment, ExecutionOutcome};
use crate::task::TestCommand;

pub const TEST_OUTPUT_START: &str = ">>>>> Start Test Output";
pub const TEST_OUTPUT_END: &str = ">>>>> End Test Output";

/// Generated script for a profile test command.
pub fn eval_script(test_cmd: &str, work_dir: Option<&str>) -> String {
    let mut script = String::from("#!/bin/bash\nset -uxo pipefail\n");
    if let Some(dir) = work_dir {
        script.push_str(&format!("cd {}\n", shell_quote(dir)));
    }
    script.push_str(&format!(": '{}'\n", TEST_OUTPUT_START));
    script.push_str(test_cmd);
    script.push_str("\nrc=$?\n");
    script.push_str(&format!(": '{}'\n", TEST_OUTPUT_END));
    script.push_str("exit $rc");
    script
}

/// `bash <<'EOF'` submission of a script. A script containing its own `EOF`
/// line gets a random terminator instead.
pub fn heredoc(script: &str) -> String {
    let delimiter = if script.lines().any(|line| line == "EOF") {
        heredoc_delimiter("EOF", script)
    } else {
        "EOF".to_string()
    };
    format!("bash <<'{delimiter}'\n{script}\n{delimiter}")
}

/// Command restoring graded test files to their committed state.
pub fn reset_command(test_files: &[String]) -> Option<String> {
    if test_files.is_empty() {
        return None;
    }
    let files: Vec<String> = test_files.iter().map(|f| shell_quote(f)).collect();
    Some(format!("git checkout HEAD -- {}", files.join(" ")))
}

/// Runs the instance's tests and returns the decision-bearing outcome.
pub async fn run_tests(
    env: &dyn Environment,
    test: &TestCommand,
    work_dir: Option<&str>,
    timeout: Duration,
) -> Result<ExecutionOutcome, SandboxError> {
    let script = match test {
        TestCommand::Script(script) => script.clone(),
        TestCommand::Profile {
            test_cmd,
            test_files,
        } => {
            if let Some(reset) = reset_command(test_files) {
                // undo any edits the candidate patch made to graded tests
                let outcome = env.execute(&reset, work_dir, None).await?;
                if outcome.return_code != 0 {
                    warn!(
                        image = %env.image(),
                        return_code = outcome.return_code,
                        output = %outcome.output.trim(),
                        "Test file reset failed"
                    );
                }
            }
            eval_script(test_cmd, work_dir)
        }
    };

    debug!(image = %env.image(), timeout_secs = timeout.as_secs(), "Running tests");
    env.execute(&heredoc(&script), work_dir, Some(timeout)).await
}

/// Output between the start and end markers, if both are present.
pub fn extract_test_output(output: &str) -> Option<&str> {
    let start = output.find(TEST_OUTPUT_START)?;
    let body_start = output[start..].find('\n').map(|i| start + i + 1)?;
    let end = output[body_start..].find(TEST_OUTPUT_END)? + body_start;
    // drop the partial line carrying the end marker (e.g. `+ : '...`)
    let body_end = output[body_start..end]
        .rfind('\n')
        .map(|i| body_start + i + 1)
        .unwrap_or(body_start);
    Some(&output[body_start..body_end])
}

/// Quotes a word for bash.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
