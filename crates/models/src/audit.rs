//! Append-only audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    StateTransition,
    AgentExecution,
    ApiCall,
    SecurityEvent,
}

impl AuditEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateTransition => "state_transition",
            Self::AgentExecution => "agent_execution",
            Self::ApiCall => "api_call",
            Self::SecurityEvent => "security_event",
        }
    }
}

/// One audit record. The payload is redacted before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    #[serde(default)]
    pub incident_id: Option<Uuid>,
    pub kind: AuditEventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Build a new event stamped with the current time.
    #[must_use]
    pub fn new(incident_id: Option<Uuid>, kind: AuditEventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}
