//! Incident state machine.
//!
//! The transition table is the single source of truth for which moves are
//! legal. An invalid transition yields a typed error and mutates nothing.
//! Every applied transition appends a timeline event and emits a
//! `state_transition` audit record. Status writes always go through a
//! connection checked out fresh from the pool, never the pipeline's own
//! session, so a failing pipeline cannot block its terminal `FAILED` row.

use chrono::Utc;
use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_models::{IncidentStatus, TimelineEvent};
use neverdown_store::{AuditLog, IncidentRepository};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

/// Whether `from -> to` is in the transition table.
///
/// Self-transitions are legal: the pipeline re-asserts `PROCESSING` with a
/// fresh detail at every stage boundary.
pub fn validate_transition(
    from: IncidentStatus,
    to: IncidentStatus,
) -> Result<(), AgentFailure> {
    use IncidentStatus as S;

    let allowed = from == to
        || matches!(
            (from, to),
            (S::Pending, S::Monitoring)
                | (S::Pending | S::Monitoring | S::Retrying, S::Processing)
                | (S::Processing, S::AwaitingReview | S::PrCreated | S::Failed)
                | (S::PrCreated, S::AwaitingReview)
                | (S::AwaitingReview, S::Resolved | S::Processing)
                | (S::Failed | S::Resolved | S::Processing, S::Pending)
                | (S::Failed | S::Resolved, S::Retrying)
        );

    if allowed {
        Ok(())
    } else {
        Err(AgentFailure::new(
            ErrorCode::InvalidStateTransition,
            format!("cannot transition from {} to {}", from.as_str(), to.as_str()),
        )
        .with_details(serde_json::json!({
            "from": from.as_str(),
            "to": to.as_str(),
        })))
    }
}

/// Validated, audited status writer.
#[derive(Clone)]
pub struct StatusWriter {
    incidents: IncidentRepository,
    audit: AuditLog,
}

impl StatusWriter {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            incidents: IncidentRepository::new(pool.clone()),
            audit: AuditLog::new(pool),
        }
    }

    /// Apply a transition: validate, persist, timeline, audit.
    ///
    /// Storage failures after validation are logged and swallowed: a
    /// dropped status write must not take the pipeline down with it.
    pub async fn transition(
        &self,
        incident_id: Uuid,
        to: IncidentStatus,
        detail: &str,
        error_message: Option<&str>,
    ) -> Result<(), AgentFailure> {
        let current = match self.incidents.get(incident_id).await {
            Ok(incident) => incident.status,
            Err(e) => {
                if let Some(failure) = e.as_not_found() {
                    return Err(failure);
                }
                warn!(%incident_id, "Could not load incident for status update: {e}");
                return Ok(());
            }
        };

        validate_transition(current, to)?;

        if let Err(e) = self
            .incidents
            .update_status(incident_id, to, error_message)
            .await
        {
            warn!(%incident_id, "Failed to update status: {e}");
            return Ok(());
        }

        let event = TimelineEvent {
            state: timeline_state(to, detail),
            timestamp: Utc::now(),
            details: Some(serde_json::json!({
                "status": to.as_str(),
                "detail": detail,
            })),
        };
        if let Err(e) = self.incidents.append_timeline(incident_id, &event).await {
            warn!(%incident_id, "Failed to append timeline event: {e}");
        }

        self.audit
            .state_transition(incident_id, current.as_str(), to.as_str(), detail)
            .await;

        info!(
            %incident_id,
            from = current.as_str(),
            to = to.as_str(),
            detail,
            "State transition"
        );
        Ok(())
    }
}

/// Timeline state marker derived from the detail text, falling back to
/// the status name when the detail is unwieldy.
fn timeline_state(status: IncidentStatus, detail: &str) -> String {
    let derived: String = detail
        .to_uppercase()
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    if derived.is_empty() || derived.len() > 50 {
        status.as_str().to_uppercase()
    } else {
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IncidentStatus as S;

    #[test]
    fn test_pipeline_transitions_allowed() {
        validate_transition(S::Pending, S::Processing).unwrap();
        validate_transition(S::Monitoring, S::Processing).unwrap();
        validate_transition(S::Processing, S::AwaitingReview).unwrap();
        validate_transition(S::AwaitingReview, S::Resolved).unwrap();
        validate_transition(S::AwaitingReview, S::Processing).unwrap();
        validate_transition(S::Processing, S::Failed).unwrap();
        validate_transition(S::Failed, S::Pending).unwrap();
        validate_transition(S::Resolved, S::Pending).unwrap();
        validate_transition(S::Pending, S::Monitoring).unwrap();
    }

    #[test]
    fn test_self_transition_allowed() {
        validate_transition(S::Processing, S::Processing).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let err = validate_transition(S::Resolved, S::AwaitingReview).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidStateTransition);
        assert_eq!(err.details["from"], "resolved");

        assert!(validate_transition(S::Monitoring, S::AwaitingReview).is_err());
        assert!(validate_transition(S::Pending, S::Resolved).is_err());
        assert!(validate_transition(S::Failed, S::AwaitingReview).is_err());
    }

    #[test]
    fn test_timeline_state_derivation() {
        assert_eq!(
            timeline_state(S::Processing, "Sanitizing repository"),
            "SANITIZING_REPOSITORY"
        );
        let long_detail = "x".repeat(80);
        assert_eq!(timeline_state(S::Failed, &long_detail), "FAILED");
        assert_eq!(timeline_state(S::Processing, ""), "PROCESSING");
    }
}
