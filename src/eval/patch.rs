//! Patch delivery into a sandbox.
//!
//! The patch travels inline as a quoted heredoc feeding `git apply`. The
//! heredoc terminator is a fresh random token per call so no patch body can
//! end the input early. Inline delivery is bounded by the OS argument size
//! limit (typically around 1 MB); larger patches fail to apply.

use tracing::debug;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::sandbox::{Environment, ExecutionOutcome};

/// A heredoc terminator that does not occur as a line of `body`.
pub fn heredoc_delimiter(prefix: &str, body: &str) -> String {
    loop {
        let token = format!("{}_{}", prefix, Uuid::new_v4().simple());
        if !body.lines().any(|line| line == token) {
            return token;
        }
    }
}

/// Shell command applying `patch` with `git apply`.
pub fn apply_command(patch: &str, delimiter: &str) -> String {
    format!("git apply <<'{delimiter}'\n{patch}\n{delimiter}")
}

/// Applies `patch` in `work_dir`. A non-zero return code means the patch
/// did not apply; the output then holds git's complaint.
pub async fn apply_patch(
    env: &dyn Environment,
    patch: &str,
    work_dir: Option<&str>,
) -> Result<ExecutionOutcome, SandboxError> {
    let delimiter = heredoc_delimiter("PATCH", patch);
    debug!(bytes = patch.len(), image = %env.image(), "Applying patch");
    env.execute(&apply_command(patch, &delimiter), work_dir, None)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_command_framing() {
        let cmd = apply_command("diff --git a/x b/x\n+y", "PATCH_abc");
        assert_eq!(cmd, "git apply <<'PATCH_abc'\ndiff --git a/x b/x\n+y\nPATCH_abc");
    }

    #[test]
    fn test_delimiter_is_fresh_per_call() {
        let a = heredoc_delimiter("PATCH", "");
        let b = heredoc_delimiter("PATCH", "");
        assert_ne!(a, b);
        assert!(a.starts_with("PATCH_"));
        // 128-bit token rendered as hex
        assert_eq!(a.len(), "PATCH_".len() + 32);
    }

    #[test]
    fn test_delimiter_avoids_body_lines() {
        let body = "EOF\nPATCH\n+ PATCH_x";
        let token = heredoc_delimiter("PATCH", body);
        assert!(!body.lines().any(|l| l == token));
    }
}
