//! Append-only audit sink.
//!
//! Every payload passes through the recursive redaction pass before it is
//! persisted or echoed to the tracing log, so a secret that slipped into a
//! details map cannot reach the audit trail. Audit writes are best-effort:
//! a failed insert is logged and swallowed, never fails the caller.

use chrono::Utc;
use neverdown_common::redact::redact_payload;
use neverdown_models::{AuditEvent, AuditEventKind};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist an audit event with its payload redacted.
    pub async fn record(
        &self,
        incident_id: Option<Uuid>,
        kind: AuditEventKind,
        payload: serde_json::Value,
    ) {
        let event = AuditEvent::new(incident_id, kind, redact_payload(&payload));

        info!(
            kind = kind.as_str(),
            incident_id = ?event.incident_id,
            "audit event"
        );

        let result = sqlx::query(
            "INSERT INTO audit_log (id, incident_id, kind, payload, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.id)
        .bind(event.incident_id)
        .bind(kind.as_str())
        .bind(Json(&event.payload))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to persist audit event: {e}");
        }
    }

    /// Record a validated state transition.
    pub async fn state_transition(
        &self,
        incident_id: Uuid,
        from: &str,
        to: &str,
        detail: &str,
    ) {
        self.record(
            Some(incident_id),
            AuditEventKind::StateTransition,
            serde_json::json!({"from": from, "to": to, "detail": detail}),
        )
        .await;
    }

    /// Record an agent stage execution outcome.
    pub async fn agent_execution(
        &self,
        incident_id: Uuid,
        agent: &str,
        success: bool,
        details: serde_json::Value,
    ) {
        self.record(
            Some(incident_id),
            AuditEventKind::AgentExecution,
            serde_json::json!({"agent": agent, "success": success, "details": details}),
        )
        .await;
    }

    /// Record a security event, e.g. a sanitizer halt.
    pub async fn security_event(
        &self,
        incident_id: Option<Uuid>,
        event_name: &str,
        severity: &str,
        details: serde_json::Value,
    ) {
        self.record(
            incident_id,
            AuditEventKind::SecurityEvent,
            serde_json::json!({"event": event_name, "severity": severity, "details": details}),
        )
        .await;
    }
}
