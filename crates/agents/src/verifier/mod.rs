//! Verifier stage: does the patch keep the project's tests green?
//!
//! Works on a scratch copy of the sanitized tree. A patch that cannot be
//! applied cleanly never executes any project code. Everything that does
//! execute runs inside the docker sandbox.

pub mod frameworks;
pub mod sandbox;

use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_config::Settings;
use neverdown_models::{Patch, TestCaseResult, TestOutcome, VerificationResult};
use sandbox::{SandboxConfig, SandboxRunner};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

const PATCH_FILE_NAME: &str = ".neverdown_patch.diff";
const APPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The verifier agent.
pub struct Verifier {
    sandbox: SandboxRunner,
    workspace_root: PathBuf,
}

impl Verifier {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            sandbox: SandboxRunner::new(SandboxConfig::from_settings(settings)),
            workspace_root: PathBuf::from(&settings.workspace_dir),
        }
    }

    /// Apply the patch to a scratch copy and run the project's tests.
    pub async fn verify(
        &self,
        incident_id: Uuid,
        sanitized_path: &Path,
        patch: &Patch,
    ) -> Result<VerificationResult, AgentFailure> {
        if !sanitized_path.is_dir() {
            return Err(AgentFailure::new(
                ErrorCode::VerificationFailed,
                format!("repository path does not exist: {}", sanitized_path.display()),
            ));
        }

        if !SandboxRunner::docker_available().await {
            return Err(AgentFailure::new(
                ErrorCode::SandboxError,
                "docker is not available for sandbox execution",
            ));
        }

        let scratch = self
            .workspace_root
            .join(format!("neverdown-verify-{}", Uuid::new_v4().simple()));
        crate::util::copy_tree(sanitized_path, &scratch, false).map_err(|e| {
            AgentFailure::new(
                ErrorCode::VerificationFailed,
                format!("could not create scratch copy: {e}"),
            )
        })?;

        let result = self.verify_in_scratch(incident_id, &scratch, patch).await;

        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!(path = %scratch.display(), "Failed to remove scratch copy: {e}");
        }

        result
    }

    async fn verify_in_scratch(
        &self,
        incident_id: Uuid,
        scratch: &Path,
        patch: &Patch,
    ) -> Result<VerificationResult, AgentFailure> {
        if !apply_patch(scratch, &patch.diff).await {
            return Ok(VerificationResult::failed(
                incident_id,
                patch.id,
                "patch could not be applied cleanly",
            ));
        }

        let Some(framework) = frameworks::detect(scratch) else {
            info!("No test framework detected");
            return Ok(VerificationResult::from_tests(
                incident_id,
                patch.id,
                Vec::new(),
                Some(self.sandbox.info()),
            ));
        };

        info!(framework = framework.name(), "Running tests in sandbox");
        let run = self
            .sandbox
            .run(
                scratch,
                &framework.command(),
                &[("CI".to_string(), "true".to_string())],
            )
            .await?;

        let tests = if run.timed_out {
            vec![TestCaseResult {
                name: "sandbox_timeout".to_string(),
                outcome: TestOutcome::Error,
                duration_ms: run.duration.as_millis() as u64,
                message: Some("Test execution timed out".to_string()),
            }]
        } else {
            framework.parse_output(&run.stdout)
        };

        Ok(VerificationResult::from_tests(
            incident_id,
            patch.id,
            tests,
            Some(self.sandbox.info()),
        ))
    }
}

/// Two-phase apply: strict check first, then a permissive three-way
/// check. A diff that passes neither never executes.
async fn apply_patch(repo_path: &Path, diff: &str) -> bool {
    let patch_file = repo_path.join(PATCH_FILE_NAME);
    if std::fs::write(&patch_file, diff).is_err() {
        return false;
    }

    let applied = apply_patch_inner(repo_path, &patch_file).await;

    let _ = std::fs::remove_file(&patch_file);
    applied
}

async fn apply_patch_inner(repo_path: &Path, patch_file: &Path) -> bool {
    if run_git(repo_path, &["apply", "--check"], patch_file).await {
        return run_git(repo_path, &["apply"], patch_file).await;
    }

    warn!("Strict patch check failed, trying three-way");
    if !run_git(repo_path, &["apply", "--3way", "--check"], patch_file).await {
        return false;
    }
    run_git(repo_path, &["apply", "--3way"], patch_file).await
}

async fn run_git(repo_path: &Path, args: &[&str], patch_file: &Path) -> bool {
    let mut command = Command::new("git");
    command
        .args(args)
        .arg(patch_file)
        .current_dir(repo_path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    match tokio::time::timeout(APPLY_TIMEOUT, command.status()).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const APPLICABLE_DIFF: &str = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,3 @@\n import os\n+PORT = 8080\n print(PORT)\n";

    #[tokio::test]
    async fn test_apply_patch_succeeds_on_matching_tree() {
        let repo = TempDir::new().unwrap();
        fs::write(repo.path().join("app.py"), "import os\nprint(PORT)\n").unwrap();

        assert!(apply_patch(repo.path(), APPLICABLE_DIFF).await);
        let patched = fs::read_to_string(repo.path().join("app.py")).unwrap();
        assert!(patched.contains("PORT = 8080"));
        // The temporary patch file is cleaned up
        assert!(!repo.path().join(PATCH_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_apply_patch_fails_on_mismatched_tree() {
        let repo = TempDir::new().unwrap();
        fs::write(repo.path().join("app.py"), "entirely different content\n").unwrap();

        assert!(!apply_patch(repo.path(), APPLICABLE_DIFF).await);
    }

    #[tokio::test]
    async fn test_unapplicable_patch_short_circuits_to_failed() {
        // Docker may be absent in CI, so exercise the scratch path only up
        // to the apply step by calling verify_in_scratch directly
        let settings = Settings::default();
        let verifier = Verifier::new(&settings);
        let repo = TempDir::new().unwrap();
        fs::write(repo.path().join("app.py"), "different\n").unwrap();

        let patch = Patch {
            id: Uuid::new_v4(),
            incident_id: Uuid::new_v4(),
            diff: APPLICABLE_DIFF.to_string(),
            reasoning: String::new(),
            confidence: 0.9,
            assumptions: vec![],
            files_changed: vec![],
            verified: false,
            token_usage: None,
            retry_count: 0,
            created_at: chrono::Utc::now(),
        };

        let result = verifier
            .verify_in_scratch(patch.incident_id, repo.path(), &patch)
            .await
            .unwrap();
        assert_eq!(
            result.status,
            neverdown_models::VerificationStatus::Failed
        );
        assert_eq!(
            result.failure_reason.as_deref(),
            Some("patch could not be applied cleanly")
        );
        assert_eq!(result.tests_passed + result.tests_failed, 0);
    }
}
