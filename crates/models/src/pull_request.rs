//! Pull-request records created by the Publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    /// Record exists, not yet created remotely
    Pending,
    Draft,
    Open,
    Merged,
    Closed,
}

/// A pull request opened for an (incident, iteration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub patch_id: Uuid,
    #[serde(default)]
    pub verification_id: Option<Uuid>,
    /// Remote PR number once created
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    pub head_branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub status: PrStatus,
    pub created_at: DateTime<Utc>,
}

impl PullRequestRecord {
    /// Whether the PR is still awaiting a human decision.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.status, PrStatus::Open | PrStatus::Draft)
    }
}
