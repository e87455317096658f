//! Incident model and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Where an incident was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSource {
    Ci,
    Logs,
    Monitoring,
    Webhook,
    Manual,
}

/// Lifecycle state of an incident.
///
/// Transitions between states are validated by the orchestrator's state
/// machine; the enum itself is just the closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Created, not yet picked up
    Pending,
    /// Dormant sentinel: waiting for a webhook to supply real logs
    Monitoring,
    /// Pipeline is running
    Processing,
    /// PR opened, waiting for a human decision
    AwaitingReview,
    /// PR record exists (transitional, before review state settles)
    PrCreated,
    /// Reviewer approved the fix
    Resolved,
    /// Terminal failure; `error_message` holds the reason
    Failed,
    /// Re-queued after a terminal state
    Retrying,
}

impl IncidentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Monitoring => "monitoring",
            Self::Processing => "processing",
            Self::AwaitingReview => "awaiting_review",
            Self::PrCreated => "pr_created",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Terminal states a retry request is accepted from.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Resolved)
    }
}

/// Repository an incident points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub commit: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl RepositoryRef {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: default_branch(),
            commit: None,
        }
    }
}

/// A single entry in an incident's append-only timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Short state marker, e.g. `RECEIVED` or `SANITIZING_REPOSITORY`
    pub state: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Payload accepted when creating an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentCreate {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_source")]
    pub source: IncidentSource,
    #[serde(default)]
    pub logs: Option<String>,
    pub repository: RepositoryRef,
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_source() -> IncidentSource {
    IncidentSource::Manual
}

/// Full incident record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub source: IncidentSource,
    pub status: IncidentStatus,
    /// Last terminal reason, if any
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub repository: RepositoryRef,
    /// Append-only, strictly time-ordered
    pub timeline: Vec<TimelineEvent>,
    pub pr_url: Option<String>,
    /// Head branch of the open PR; reused by refinement iterations
    pub pr_branch: Option<String>,
    /// Bounded by the configured refinement cap
    pub feedback_iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    /// Build a fresh incident from a creation payload.
    #[must_use]
    pub fn from_create(data: IncidentCreate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: data.title,
            description: data.description,
            severity: data.severity,
            source: data.source,
            status: IncidentStatus::Pending,
            error_message: None,
            logs: data.logs,
            repository: data.repository,
            timeline: Vec::new(),
            pr_url: None,
            pr_branch: None,
            feedback_iteration: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a timeline event, keeping the sequence time-ordered.
    pub fn push_timeline(&mut self, state: impl Into<String>, details: Option<serde_json::Value>) {
        self.timeline.push(TimelineEvent {
            state: state.into(),
            timestamp: Utc::now(),
            details,
        });
        self.updated_at = Utc::now();
    }
}

/// Dormant-sentinel heuristic: logs are actionable when they carry enough
/// signal to analyse. Fewer than 20 non-blank characters with no `error`
/// token means the incident should wait in `MONITORING` for a webhook.
#[must_use]
pub fn logs_are_actionable(logs: Option<&str>) -> bool {
    let Some(logs) = logs else {
        return false;
    };
    let non_blank: usize = logs.chars().filter(|c| !c.is_whitespace()).count();
    if non_blank >= 20 {
        return true;
    }
    logs.to_lowercase().contains("error")
}
