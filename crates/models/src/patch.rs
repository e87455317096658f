//! Patch model produced by the Reasoner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a diff does to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Modified,
    Added,
    Deleted,
    Renamed,
}

/// Per-file summary of a unified diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub additions: u32,
    pub deletions: u32,
}

/// LLM token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A validated fix proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: Uuid,
    pub incident_id: Uuid,
    /// Unified diff text
    pub diff: String,
    /// Root cause explanation in markdown
    pub reasoning: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<FileChange>,
    /// Set after the Verifier runs
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    /// LLM attempts consumed before this patch parsed and validated
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Patch {
    /// Total changed lines across all files.
    #[must_use]
    pub fn total_changes(&self) -> u32 {
        self.files_changed
            .iter()
            .map(|f| f.additions + f.deletions)
            .sum()
    }

    /// Brief human summary, e.g. `2 file(s), +10/-3`.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.files_changed.is_empty() {
            return "No files changed".to_string();
        }
        let additions: u32 = self.files_changed.iter().map(|f| f.additions).sum();
        let deletions: u32 = self.files_changed.iter().map(|f| f.deletions).sum();
        format!(
            "{} file(s), +{additions}/-{deletions}",
            self.files_changed.len()
        )
    }
}

/// Full Reasoner output: the patch plus the narrative around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonerOutput {
    pub incident_id: Uuid,
    pub patch: Patch,
    /// One-line root cause
    pub root_cause_summary: String,
    pub detailed_explanation: String,
    pub confidence: f64,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub risk_assessment: String,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub llm_model: String,
}
