//! Publisher stage: branch, push, pull request. Never merges.
//!
//! The diff is applied to the *original* working tree (not the sanitized
//! copy) and the resulting file contents are pushed file-by-file through
//! the git host's contents RPC onto a fresh branch. Refinement iterations
//! reuse the incident's existing branch instead of opening a new PR.

pub mod github;

use chrono::Utc;
use github::{CreatePullRequest, GithubClient, GithubError};
use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_config::Settings;
use neverdown_models::{
    FileAction, Patch, PrStatus, PullRequestRecord, VerificationResult, VerificationStatus,
};
use std::fmt::Write as _;
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

/// Input assembled by the orchestrator.
pub struct PublishInput<'a> {
    pub incident_id: Uuid,
    pub original_repo_path: &'a Path,
    pub patch: &'a Patch,
    pub verification: &'a VerificationResult,
    pub repo_url: &'a str,
    pub root_cause_summary: &'a str,
}

/// The publisher agent.
pub struct Publisher {
    github: GithubClient,
    manual_apply_enabled: bool,
}

impl Publisher {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            github: GithubClient::from_settings(settings),
            manual_apply_enabled: settings.publisher_manual_apply,
        }
    }

    /// Build with an explicit client (tests point this at a mock server).
    #[must_use]
    pub fn with_client(github: GithubClient, manual_apply_enabled: bool) -> Self {
        Self {
            github,
            manual_apply_enabled,
        }
    }

    /// Open a new pull request for the incident.
    pub async fn publish(
        &self,
        input: &PublishInput<'_>,
    ) -> Result<PullRequestRecord, AgentFailure> {
        self.check_verification(input.verification)?;

        let (owner, repo) = GithubClient::parse_repo_url(input.repo_url)
            .map_err(|e| AgentFailure::new(ErrorCode::GithubApiError, e.to_string()))?;

        let branch_name = generate_branch_name(input.incident_id);

        let default_branch = self
            .github
            .default_branch(&owner, &repo)
            .await
            .map_err(to_failure)?;
        let base_sha = self
            .github
            .ref_sha(&owner, &repo, &format!("heads/{default_branch}"))
            .await
            .map_err(to_failure)?;
        self.github
            .create_branch(&owner, &repo, &branch_name, &base_sha)
            .await
            .map_err(to_failure)?;

        self.apply_and_push(input, &owner, &repo, &branch_name).await?;

        let title = format!(
            "[NeverDown] Fix: {}",
            input.root_cause_summary.chars().take(50).collect::<String>()
        );
        let body = build_pr_body(input);
        let labels = determine_labels(input.patch, input.verification);

        let remote = self
            .github
            .create_pull_request(
                &owner,
                &repo,
                &CreatePullRequest {
                    title: title.clone(),
                    body: body.clone(),
                    head_branch: branch_name.clone(),
                    base_branch: default_branch.clone(),
                    draft: false,
                },
            )
            .await
            .map_err(to_failure)?;

        self.github
            .add_labels(&owner, &repo, remote.number, &labels)
            .await;

        info!(pr = remote.number, url = %remote.url, "Opened pull request");

        Ok(PullRequestRecord {
            id: Uuid::new_v4(),
            incident_id: input.incident_id,
            patch_id: input.patch.id,
            verification_id: Some(input.verification.id),
            number: Some(remote.number),
            url: Some(remote.url),
            head_branch: branch_name,
            base_branch: default_branch,
            title,
            body,
            labels,
            status: PrStatus::Open,
            created_at: Utc::now(),
        })
    }

    /// Refinement path: apply and push to the incident's existing branch,
    /// appending commits to the already-open PR.
    pub async fn update_existing(
        &self,
        input: &PublishInput<'_>,
        existing_branch: &str,
    ) -> Result<(), AgentFailure> {
        self.check_verification(input.verification)?;

        let (owner, repo) = GithubClient::parse_repo_url(input.repo_url)
            .map_err(|e| AgentFailure::new(ErrorCode::GithubApiError, e.to_string()))?;

        self.apply_and_push(input, &owner, &repo, existing_branch).await?;
        info!(branch = existing_branch, "Pushed refinement to existing branch");
        Ok(())
    }

    fn check_verification(&self, verification: &VerificationResult) -> Result<(), AgentFailure> {
        match verification.status {
            VerificationStatus::Passed => Ok(()),
            VerificationStatus::NoTests => {
                warn!("Creating PR without test verification");
                Ok(())
            }
            other => Err(AgentFailure::new(
                ErrorCode::VerificationFailed,
                format!("cannot create PR: verification status is {}", other.as_str()),
            )),
        }
    }

    /// Apply the diff to the original tree, then push every changed file
    /// to the branch, one commit per file. Per-file push failures are
    /// logged and skipped.
    async fn apply_and_push(
        &self,
        input: &PublishInput<'_>,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<(), AgentFailure> {
        let tree = input.original_repo_path;

        ensure_git_baseline(tree).await;

        if !git_apply(tree, &input.patch.diff).await {
            if !self.manual_apply_enabled {
                return Err(AgentFailure::new(
                    ErrorCode::InvalidPatch,
                    "patch does not apply to the original tree",
                ));
            }
            warn!("git apply failed, falling back to manual apply");
            if !manual_apply(tree, &input.patch.diff) {
                return Err(AgentFailure::new(
                    ErrorCode::InvalidPatch,
                    "patch does not apply to the original tree",
                ));
            }
        }

        for change in &input.patch.files_changed {
            if change.action == FileAction::Deleted {
                continue;
            }
            let file_path = tree.join(&change.path);
            let content = match std::fs::read_to_string(&file_path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %change.path, "File not found after apply, skipping: {e}");
                    continue;
                }
            };

            let message = format!("[NeverDown] Apply fix to {}", change.path);
            if let Err(e) = self
                .github
                .put_file(owner, repo, branch, &change.path, &content, &message)
                .await
            {
                warn!(path = %change.path, "Failed to push file: {e}");
            }
        }

        Ok(())
    }
}

fn to_failure(err: GithubError) -> AgentFailure {
    AgentFailure::new(ErrorCode::GithubApiError, err.to_string())
}

/// `neverdown/fix-<first 8 of incident id>-<UTC timestamp>`.
fn generate_branch_name(incident_id: Uuid) -> String {
    let short_id: String = incident_id.simple().to_string().chars().take(8).collect();
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    format!("neverdown/fix-{short_id}-{timestamp}")
}

/// Make sure the tree can take a `git apply`: initialise a repository and
/// commit the initial state when none exists.
async fn ensure_git_baseline(tree: &Path) {
    if tree.join(".git").exists() {
        return;
    }
    let steps: [&[&str]; 3] = [
        &["init"],
        &["add", "-A"],
        &[
            "-c",
            "user.email=bot@neverdown.dev",
            "-c",
            "user.name=neverdown",
            "commit",
            "-m",
            "Baseline before automated fix",
        ],
    ];
    for args in steps {
        let result = Command::new("git")
            .args(args)
            .current_dir(tree)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        if !matches!(result, Ok(status) if status.success()) {
            warn!(args = ?args, "git baseline step failed");
            return;
        }
    }
}

async fn git_apply(tree: &Path, diff: &str) -> bool {
    let patch_file = tree.join(".neverdown_publish.diff");
    if std::fs::write(&patch_file, diff).is_err() {
        return false;
    }

    let check = run_git_status(tree, &["apply", "--check"], &patch_file).await;
    let applied = if check {
        run_git_status(tree, &["apply"], &patch_file).await
    } else {
        false
    };

    let _ = std::fs::remove_file(&patch_file);
    applied
}

async fn run_git_status(tree: &Path, args: &[&str], patch_file: &Path) -> bool {
    Command::new("git")
        .args(args)
        .arg(patch_file)
        .current_dir(tree)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Structural fallback when `git apply` strict-fails: per file, substitute
/// the joined removed block with the joined added block, or fall back to
/// line-wise removal and insertion at the first removal site.
fn manual_apply(tree: &Path, diff: &str) -> bool {
    let sections = split_per_file(diff);
    if sections.is_empty() {
        return false;
    }

    let mut any_applied = false;

    for section in &sections {
        let file_path = tree.join(&section.path);

        if section.removed.is_empty() && !section.added.is_empty() && !file_path.exists() {
            // Pure addition of a new file
            if let Some(parent) = file_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if std::fs::write(&file_path, section.added.join("\n") + "\n").is_ok() {
                any_applied = true;
            }
            continue;
        }

        let Ok(content) = std::fs::read_to_string(&file_path) else {
            warn!(path = %section.path, "Manual apply: file unreadable, skipping");
            continue;
        };

        let removed_block = section.removed.join("\n");
        let added_block = section.added.join("\n");

        let updated = if !removed_block.is_empty() && content.contains(&removed_block) {
            content.replacen(&removed_block, &added_block, 1)
        } else {
            let mut lines: Vec<String> = content.lines().map(String::from).collect();
            let mut insert_at = None;
            for removed in &section.removed {
                if let Some(pos) = lines.iter().position(|l| l == removed) {
                    lines.remove(pos);
                    insert_at.get_or_insert(pos);
                }
            }
            let at = insert_at.unwrap_or(lines.len()).min(lines.len());
            for (offset, added) in section.added.iter().enumerate() {
                lines.insert(at + offset, added.clone());
            }
            lines.join("\n") + "\n"
        };

        if std::fs::write(&file_path, updated).is_ok() {
            any_applied = true;
        }
    }

    any_applied
}

struct FileSection {
    path: String,
    removed: Vec<String>,
    added: Vec<String>,
}

fn split_per_file(diff: &str) -> Vec<FileSection> {
    let mut sections: Vec<FileSection> = Vec::new();

    for line in diff.lines() {
        if let Some(path) = line.strip_prefix("+++ ") {
            let path = path.trim_start_matches("b/").trim().to_string();
            if path != "/dev/null" {
                sections.push(FileSection {
                    path,
                    removed: Vec::new(),
                    added: Vec::new(),
                });
            }
            continue;
        }
        let Some(current) = sections.last_mut() else {
            continue;
        };
        if let Some(added) = line.strip_prefix('+') {
            current.added.push(added.to_string());
        } else if let Some(removed) = line.strip_prefix('-') {
            if !removed.starts_with("--") {
                current.removed.push(removed.to_string());
            }
        }
    }

    sections
}

/// Structured PR description ending with the human-review notice.
fn build_pr_body(input: &PublishInput<'_>) -> String {
    let patch = input.patch;
    let verification = input.verification;

    let mut body = format!(
        "## 🤖 Automated Fix by NeverDown\n\n\
         ### Incident ID\n`{}`\n\n\
         ### Root Cause\n{}\n\n\
         ### Analysis Confidence\n{:.1}%\n\n\
         ### Reasoning\n{}{}\n\n\
         ### Assumptions Made\n",
        input.incident_id,
        input.root_cause_summary,
        patch.confidence * 100.0,
        patch.reasoning.chars().take(500).collect::<String>(),
        if patch.reasoning.chars().count() > 500 { "..." } else { "" },
    );

    if patch.assumptions.is_empty() {
        body.push_str("- None\n");
    } else {
        for assumption in &patch.assumptions {
            let _ = writeln!(body, "- {assumption}");
        }
    }

    let _ = write!(
        body,
        "\n### Verification Status\n\
         - **Status**: {}\n\
         - **Tests Passed**: {}\n\
         - **Tests Failed**: {}\n\n\
         ### Files Changed\n",
        verification.status.as_str().to_uppercase(),
        verification.tests_passed,
        verification.tests_failed,
    );

    for change in &patch.files_changed {
        let action = match change.action {
            FileAction::Modified => "modified",
            FileAction::Added => "added",
            FileAction::Deleted => "deleted",
            FileAction::Renamed => "renamed",
        };
        let _ = writeln!(
            body,
            "- `{}` ({action}): +{}/-{}",
            change.path, change.additions, change.deletions
        );
    }

    body.push_str(
        "\n---\n\n\
         > ⚠️ **Human Review Required**: This PR was created automatically and must be reviewed before merging.\n\
         >\n\
         > NeverDown does NOT auto-merge PRs. All fixes require human approval.\n",
    );

    body
}

/// Project markers plus a confidence tier and a verification tier.
fn determine_labels(patch: &Patch, verification: &VerificationResult) -> Vec<String> {
    let mut labels = vec!["neverdown".to_string(), "automated-fix".to_string()];

    if patch.confidence >= 0.9 {
        labels.push("high-confidence".to_string());
    } else if patch.confidence >= 0.7 {
        labels.push("medium-confidence".to_string());
    } else {
        labels.push("low-confidence".to_string());
    }

    match verification.status {
        VerificationStatus::Passed => labels.push("tests-passing".to_string()),
        VerificationStatus::NoTests => labels.push("needs-tests".to_string()),
        _ => labels.push("tests-failing".to_string()),
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use neverdown_common::Secret;
    use neverdown_models::{FileChange, TestCaseResult, TestOutcome};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_patch(incident_id: Uuid, confidence: f64) -> Patch {
        Patch {
            id: Uuid::new_v4(),
            incident_id,
            diff: "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,3 @@\n import os\n+PORT = 8080\n print(PORT)\n".to_string(),
            reasoning: "PORT constant was dropped in a refactor.".to_string(),
            confidence,
            assumptions: vec!["default port 8080".to_string()],
            files_changed: vec![FileChange {
                path: "app.py".to_string(),
                action: FileAction::Modified,
                additions: 1,
                deletions: 0,
            }],
            verified: true,
            token_usage: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    fn passed_verification(incident_id: Uuid, patch_id: Uuid) -> VerificationResult {
        VerificationResult::from_tests(
            incident_id,
            patch_id,
            vec![TestCaseResult {
                name: "test_boot".to_string(),
                outcome: TestOutcome::Passed,
                duration_ms: 5,
                message: None,
            }],
            None,
        )
    }

    async fn mock_github(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/widget"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "default_branch": "main"
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/git/ref/heads/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": {"sha": "base-sha"}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widget/git/refs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/repos/acme/widget/contents/.*$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/repos/acme/widget/contents/.*$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "commit": {"sha": "push-sha"}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widget/pulls"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "number": 42,
                "html_url": "https://github.com/acme/widget/pull/42",
                "state": "open",
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widget/issues/42/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_publish_happy_path() {
        let server = MockServer::start().await;
        mock_github(&server).await;

        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("app.py"), "import os\nprint(PORT)\n").unwrap();

        let incident_id = Uuid::new_v4();
        let patch = sample_patch(incident_id, 0.92);
        let verification = passed_verification(incident_id, patch.id);

        let publisher = Publisher::with_client(
            GithubClient::new(Secret::new("ghp_test"), 5, Some(server.uri())),
            true,
        );

        let record = publisher
            .publish(&PublishInput {
                incident_id,
                original_repo_path: tree.path(),
                patch: &patch,
                verification: &verification,
                repo_url: "https://github.com/acme/widget",
                root_cause_summary: "PORT constant missing",
            })
            .await
            .unwrap();

        assert_eq!(record.number, Some(42));
        assert_eq!(record.url.as_deref(), Some("https://github.com/acme/widget/pull/42"));
        assert!(record.head_branch.starts_with("neverdown/fix-"));
        assert!(record.labels.contains(&"high-confidence".to_string()));
        assert!(record.labels.contains(&"tests-passing".to_string()));
        assert!(record.body.ends_with("All fixes require human approval.\n"));

        // The original tree actually got the fix
        let applied = std::fs::read_to_string(tree.path().join("app.py")).unwrap();
        assert!(applied.contains("PORT = 8080"));
    }

    #[tokio::test]
    async fn test_failed_verification_refused() {
        let incident_id = Uuid::new_v4();
        let patch = sample_patch(incident_id, 0.9);
        let verification = VerificationResult::failed(incident_id, patch.id, "2 test(s) failed");

        let publisher = Publisher::with_client(
            GithubClient::new(Secret::new("ghp_test"), 5, None),
            true,
        );
        let tree = TempDir::new().unwrap();

        let err = publisher
            .publish(&PublishInput {
                incident_id,
                original_repo_path: tree.path(),
                patch: &patch,
                verification: &verification,
                repo_url: "acme/widget",
                root_cause_summary: "irrelevant",
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::VerificationFailed);
    }

    #[tokio::test]
    async fn test_refinement_pushes_without_new_pr() {
        let server = MockServer::start().await;
        mock_github(&server).await;

        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("app.py"), "import os\nprint(PORT)\n").unwrap();

        let incident_id = Uuid::new_v4();
        let patch = sample_patch(incident_id, 0.9);
        let verification = passed_verification(incident_id, patch.id);

        let publisher = Publisher::with_client(
            GithubClient::new(Secret::new("ghp_test"), 5, Some(server.uri())),
            true,
        );

        publisher
            .update_existing(
                &PublishInput {
                    incident_id,
                    original_repo_path: tree.path(),
                    patch: &patch,
                    verification: &verification,
                    repo_url: "https://github.com/acme/widget",
                    root_cause_summary: "PORT constant missing",
                },
                "neverdown/fix-12345678-20260101000000",
            )
            .await
            .unwrap();

        // No PR was opened: only contents calls hit the server
        let requests = server.received_requests().await.unwrap();
        assert!(!requests.iter().any(|r| r.url.path() == "/repos/acme/widget/pulls"));
    }

    #[test]
    fn test_branch_name_shape() {
        let incident_id = Uuid::new_v4();
        let name = generate_branch_name(incident_id);
        assert!(name.starts_with("neverdown/fix-"));
        let parts: Vec<&str> = name.rsplitn(2, '-').collect();
        assert_eq!(parts[0].len(), 14); // YYYYMMDDHHMMSS
    }

    #[test]
    fn test_label_tiers() {
        let incident_id = Uuid::new_v4();
        let patch = sample_patch(incident_id, 0.75);
        let no_tests =
            VerificationResult::from_tests(incident_id, patch.id, vec![], None);
        let labels = determine_labels(&patch, &no_tests);
        assert!(labels.contains(&"medium-confidence".to_string()));
        assert!(labels.contains(&"needs-tests".to_string()));

        let low = sample_patch(incident_id, 0.4);
        let labels = determine_labels(&low, &no_tests);
        assert!(labels.contains(&"low-confidence".to_string()));
    }

    #[test]
    fn test_manual_apply_block_substitution() {
        let tree = TempDir::new().unwrap();
        std::fs::write(
            tree.path().join("app.py"),
            "import os\nvalue = 1\nprint(value)\n",
        )
        .unwrap();

        let diff = "--- a/app.py\n+++ b/app.py\n@@ -2 +2 @@\n-value = 1\n+value = 2\n";
        assert!(manual_apply(tree.path(), diff));
        let content = std::fs::read_to_string(tree.path().join("app.py")).unwrap();
        assert!(content.contains("value = 2"));
        assert!(!content.contains("value = 1"));
    }

    #[test]
    fn test_manual_apply_line_wise_fallback() {
        let tree = TempDir::new().unwrap();
        // The removed block does not appear contiguously, forcing the
        // line-wise path
        std::fs::write(
            tree.path().join("app.py"),
            "alpha\nnoise\nbeta\ntail\n",
        )
        .unwrap();

        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1,3 +1,2 @@\n-alpha\n-beta\n+gamma\n";
        assert!(manual_apply(tree.path(), diff));
        let content = std::fs::read_to_string(tree.path().join("app.py")).unwrap();
        assert!(content.contains("gamma"));
        assert!(!content.contains("alpha"));
        assert!(!content.contains("beta"));
    }

    #[test]
    fn test_manual_apply_creates_new_file() {
        let tree = TempDir::new().unwrap();
        let diff = "--- /dev/null\n+++ b/config.py\n@@ -0,0 +1,2 @@\n+PORT = 8080\n+DEBUG = False\n";
        assert!(manual_apply(tree.path(), diff));
        let content = std::fs::read_to_string(tree.path().join("config.py")).unwrap();
        assert_eq!(content, "PORT = 8080\nDEBUG = False\n");
    }
}
