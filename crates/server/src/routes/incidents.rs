//! Incident CRUD, retry, feedback and stage artifacts.

use crate::error::{ApiError, ApiResult};
use crate::server::ServerState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use neverdown_common::ErrorCode;
use neverdown_models::{
    logs_are_actionable, Incident, IncidentCreate, IncidentStatus, Severity,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<IncidentStatus>,
    pub severity: Option<Severity>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// `POST /incidents`: create and queue for processing. Incidents without
/// actionable logs become dormant sentinels in `MONITORING`.
pub async fn create_incident(
    State(state): State<Arc<ServerState>>,
    Json(data): Json<IncidentCreate>,
) -> ApiResult<(StatusCode, Json<Incident>)> {
    if !state.settings.repo_allowed(&data.repository.url) {
        return Err(ApiError::new(
            ErrorCode::UnauthorizedRepo,
            format!("repository {} is not on the allow-list", data.repository.url),
        ));
    }

    let incident = Incident::from_create(data);
    state.incidents().create(&incident).await?;
    state
        .incidents()
        .append_timeline(
            incident.id,
            &neverdown_models::TimelineEvent {
                state: "RECEIVED".to_string(),
                timestamp: chrono::Utc::now(),
                details: Some(serde_json::json!({"source": incident.source})),
            },
        )
        .await?;

    if logs_are_actionable(incident.logs.as_deref()) {
        spawn_pipeline(&state, incident.id);
    } else {
        // Dormant sentinel: wait for a CI webhook to bring real logs
        state
            .status
            .transition(
                incident.id,
                IncidentStatus::Monitoring,
                "Monitoring via webhooks",
                None,
            )
            .await?;
        info!(incident_id = %incident.id, "Incident parked in MONITORING");
    }

    let stored = state.incidents().get(incident.id).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// `GET /incidents`: list with filters and pagination.
pub async fn list_incidents(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Incident>>> {
    let limit = query.limit.clamp(1, 100);
    let offset = query.offset.max(0);
    let incidents = state
        .incidents()
        .list(query.status, query.severity, limit, offset)
        .await?;
    Ok(Json(incidents))
}

/// `GET /incidents/{id}`: detail including timeline.
pub async fn get_incident(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Incident>> {
    Ok(Json(state.incidents().get(id).await?))
}

/// `POST /incidents/{id}/retry`: re-queue from a terminal state.
pub async fn retry_incident(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Incident>> {
    let incident = state.incidents().get(id).await?;
    if !incident.status.is_terminal() {
        return Err(ApiError::new(
            ErrorCode::InvalidStateTransition,
            format!("cannot retry incident with status {}", incident.status.as_str()),
        ));
    }

    state
        .status
        .transition(id, IncidentStatus::Pending, "Retry requested", None)
        .await?;
    spawn_pipeline(&state, id);

    Ok(Json(state.incidents().get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub decision: FeedbackDecision,
    #[serde(default)]
    pub feedback_text: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackDecision {
    Approve,
    RequestChanges,
}

/// `POST /incidents/{id}/feedback`: reviewer decision on an open PR.
pub async fn submit_feedback(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<FeedbackRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let incident = state.incidents().get(id).await?;
    if incident.status != IncidentStatus::AwaitingReview {
        return Err(ApiError::new(
            ErrorCode::InvalidStateTransition,
            format!(
                "feedback requires status awaiting_review, incident is {}",
                incident.status.as_str()
            ),
        ));
    }

    match request.decision {
        FeedbackDecision::Approve => {
            state
                .status
                .transition(id, IncidentStatus::Resolved, "Reviewer approved the fix", None)
                .await?;
            Ok(Json(serde_json::json!({"status": "resolved"})))
        }
        FeedbackDecision::RequestChanges => {
            if incident.feedback_iteration >= state.settings.refinement_max_iterations {
                return Err(ApiError::new(
                    ErrorCode::MaxRetriesExceeded,
                    format!(
                        "refinement limit of {} iterations reached",
                        state.settings.refinement_max_iterations
                    ),
                ));
            }

            let feedback = request.feedback_text.unwrap_or_default();
            let orchestrator = state.orchestrator();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run_refinement(id, &feedback).await {
                    tracing::error!(incident_id = %id, "Refinement failed: {e}");
                }
            });

            Ok(Json(serde_json::json!({
                "status": "refinement_queued",
                "iteration": incident.feedback_iteration + 1,
            })))
        }
    }
}

/// `DELETE /incidents/{id}`: admin removal; cascades to all artifacts.
pub async fn delete_incident(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.incidents().delete(id).await?;
    info!(incident_id = %id, "Incident deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /incidents/{id}/{detective|reasoner|verifier}`: stage artifact.
pub async fn get_stage_artifact(
    State(state): State<Arc<ServerState>>,
    Path((id, agent)): Path<(Uuid, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    if !matches!(agent.as_str(), "detective" | "reasoner" | "verifier") {
        return Err(ApiError::new(
            ErrorCode::IncidentNotFound,
            format!("unknown stage artifact: {agent}"),
        ));
    }

    // 404 on a missing incident, not an empty artifact
    state.incidents().get(id).await?;

    let artifact = state.analyses().latest(id, &agent).await?;
    match artifact {
        Some(value) => Ok(Json(value)),
        None => Err(ApiError::new(
            ErrorCode::IncidentNotFound,
            format!("no {agent} artifact recorded for incident {id}"),
        )),
    }
}

/// Launch a pipeline run as a detached task.
pub fn spawn_pipeline(state: &Arc<ServerState>, incident_id: Uuid) {
    let orchestrator = state.orchestrator();
    tokio::spawn(async move {
        let ok = orchestrator.process_incident(incident_id).await;
        if ok {
            info!(%incident_id, "Pipeline completed, awaiting review");
        }
    });
}
