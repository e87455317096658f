//! Verification results from the sandbox stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Running,
    Passed,
    Failed,
    /// Some tests pass, some fail
    Partial,
    /// Infrastructure error, not a test failure
    Error,
    /// No tests found or executed
    NoTests,
}

impl VerificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Error => "error",
            Self::NoTests => "no_tests",
        }
    }

    /// Whether the default pipeline may continue to the Publisher.
    ///
    /// `no_tests` proceeds (the PR gets a `needs-tests` label); `failed`
    /// halts until a refinement iteration revisits it.
    #[must_use]
    pub fn allows_publish(self) -> bool {
        matches!(self, Self::Passed | Self::NoTests)
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

/// One normalised test record parsed from framework output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Sandbox environment metadata attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub image: String,
    pub memory_limit: String,
    pub timeout_secs: u64,
}

/// Result of verifying a patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub patch_id: Uuid,
    pub status: VerificationStatus,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    #[serde(default)]
    pub tests: Vec<TestCaseResult>,
    /// Short reason when `status` is `failed` or `error`
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub sandbox: Option<SandboxInfo>,
    pub created_at: DateTime<Utc>,
}

impl VerificationResult {
    /// Build a result from normalised test records, applying the
    /// aggregation rules.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_tests(
        incident_id: Uuid,
        patch_id: Uuid,
        tests: Vec<TestCaseResult>,
        sandbox: Option<SandboxInfo>,
    ) -> Self {
        let passed = tests.iter().filter(|t| t.outcome == TestOutcome::Passed).count();
        let failed = tests.iter().filter(|t| t.outcome == TestOutcome::Failed).count();
        let skipped = tests.iter().filter(|t| t.outcome == TestOutcome::Skipped).count();
        let errored = tests.iter().filter(|t| t.outcome == TestOutcome::Error).count();

        let (status, reason) = if failed > 0 {
            (VerificationStatus::Failed, Some(format!("{failed} test(s) failed")))
        } else if errored > 0 && passed == 0 {
            (
                VerificationStatus::Error,
                tests
                    .iter()
                    .find(|t| t.outcome == TestOutcome::Error)
                    .and_then(|t| t.message.clone()),
            )
        } else if passed > 0 {
            (VerificationStatus::Passed, None)
        } else {
            (
                VerificationStatus::NoTests,
                Some("No tests found or executed".to_string()),
            )
        };

        Self {
            id: Uuid::new_v4(),
            incident_id,
            patch_id,
            status,
            tests_passed: passed as u32,
            tests_failed: failed as u32,
            tests_skipped: skipped as u32,
            tests,
            failure_reason: reason,
            sandbox,
            created_at: Utc::now(),
        }
    }

    /// A result that failed before any test ran.
    #[must_use]
    pub fn failed(incident_id: Uuid, patch_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            patch_id,
            status: VerificationStatus::Failed,
            tests_passed: 0,
            tests_failed: 0,
            tests_skipped: 0,
            tests: Vec::new(),
            failure_reason: Some(reason.into()),
            sandbox: None,
            created_at: Utc::now(),
        }
    }
}
