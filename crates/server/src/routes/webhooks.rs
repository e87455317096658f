//! Webhook ingress: GitHub CI events and Datadog alerts.
//!
//! GitHub payloads are authenticated with HMAC-SHA256 over the raw body
//! (`X-Hub-Signature-256: sha256=<hex>`, constant-time comparison).
//! Pipeline execution is strictly asynchronous: webhook callers get a
//! synchronous acknowledgement and the run happens in a spawned task.

use crate::error::{ApiError, ApiResult};
use crate::routes::incidents::spawn_pipeline;
use crate::server::ServerState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use hmac::{Hmac, Mac};
use neverdown_common::ErrorCode;
use neverdown_models::{
    Incident, IncidentCreate, IncidentSource, IncidentStatus, RepositoryRef, Severity,
};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Verify `sha256=<hex>` over the raw body. Constant-time.
pub fn verify_github_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// `POST /webhooks/github`.
pub async fn github_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let secret = &state.settings.github_webhook_secret;
    if !secret.is_empty() {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::new(ErrorCode::UnauthorizedRepo, "missing signature"))?;
        if !verify_github_signature(&body, signature, secret.expose()) {
            warn!("Invalid GitHub webhook signature");
            state
                .audit
                .security_event(
                    None,
                    "invalid_webhook_signature",
                    "high",
                    json!({"source": "github"}),
                )
                .await;
            return Err(ApiError::new(ErrorCode::UnauthorizedRepo, "invalid signature"));
        }
    }

    // Replayed deliveries must not create duplicate incidents
    if let Some(delivery_id) = headers.get("X-GitHub-Delivery").and_then(|v| v.to_str().ok()) {
        if !state.deliveries.record(delivery_id) {
            info!(delivery_id, "Duplicate webhook delivery ignored");
            return Ok(Json(json!({"status": "duplicate", "delivery_id": delivery_id})));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::new(ErrorCode::InvalidPatch, "invalid JSON payload"))?;

    let event = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    info!(github_event = event, action = payload["action"].as_str(), "Received GitHub webhook");

    match event {
        "workflow_run" => handle_workflow_run(&state, &payload).await,
        "check_run" | "check_suite" => handle_check_event(&state, &payload, event).await,
        "ping" => Ok(Json(json!({"status": "ok", "message": "pong"}))),
        "push" => Ok(Json(json!({
            "status": "ignored",
            "reason": "push events are not processed, waiting for workflow_run or check_run",
        }))),
        other => Ok(Json(json!({"status": "ignored", "github_event": other}))),
    }
}

async fn handle_workflow_run(
    state: &Arc<ServerState>,
    payload: &Value,
) -> ApiResult<Json<Value>> {
    let run = &payload["workflow_run"];
    let action = payload["action"].as_str().unwrap_or("");
    let conclusion = run["conclusion"].as_str().unwrap_or("");

    if action != "completed" || conclusion != "failure" {
        if action == "completed" && conclusion == "success" {
            info!(
                workflow = run["name"].as_str(),
                "All clear - CI passed, staying dormant"
            );
        }
        return Ok(Json(json!({"status": "ignored", "reason": "not a failure"})));
    }

    let repo_url = payload["repository"]["html_url"].as_str().unwrap_or("");
    let workflow_name = run["name"].as_str().unwrap_or("Unknown workflow");
    let branch = run["head_branch"].as_str().unwrap_or("main");
    let logs = format!(
        "CI Failure Detected via Webhook\nWorkflow: {workflow_name}\nBranch: {branch}\nCommit: {}\nRun URL: {}\nConclusion: failure\n\nError: The workflow run failed. Check the run URL for detailed logs.",
        run["head_sha"].as_str().unwrap_or(""),
        run["html_url"].as_str().unwrap_or(""),
    );

    // A dormant sentinel for this repo takes precedence over a fresh
    // incident
    if let Some(activated) = activate_monitoring_incident(state, repo_url, &logs, run).await? {
        return Ok(Json(activated));
    }

    let incident = Incident::from_create(IncidentCreate {
        title: format!("CI Failure: {workflow_name}"),
        description: Some(format!(
            "GitHub Actions workflow failed on branch {branch}"
        )),
        severity: Severity::High,
        source: IncidentSource::Ci,
        logs: Some(logs),
        repository: RepositoryRef {
            url: repo_url.to_string(),
            branch: branch.to_string(),
            commit: run["head_sha"].as_str().map(String::from),
        },
    });

    if !state.settings.repo_allowed(repo_url) {
        return Err(ApiError::new(
            ErrorCode::UnauthorizedRepo,
            format!("repository {repo_url} is not on the allow-list"),
        ));
    }

    state.incidents().create(&incident).await?;
    spawn_pipeline(state, incident.id);
    info!(incident_id = %incident.id, "Created incident from workflow_run webhook");

    Ok(Json(json!({
        "status": "created",
        "incident_id": incident.id.to_string(),
    })))
}

/// Activate the most recent `MONITORING` incident whose repository
/// matches (canonicalised) this webhook's repository.
async fn activate_monitoring_incident(
    state: &Arc<ServerState>,
    repo_url: &str,
    logs: &str,
    run: &Value,
) -> ApiResult<Option<Value>> {
    let Some(incident) = state.incidents().latest_monitoring_for_repo(repo_url).await? else {
        return Ok(None);
    };

    info!(
        incident_id = %incident.id,
        repo_url,
        "Activating MONITORING incident for CI failure"
    );

    state.incidents().set_logs(incident.id, logs).await?;
    state
        .incidents()
        .append_timeline(
            incident.id,
            &neverdown_models::TimelineEvent {
                state: "CI_FAILURE_DETECTED".to_string(),
                timestamp: chrono::Utc::now(),
                details: Some(json!({
                    "workflow": run["name"],
                    "branch": run["head_branch"],
                    "conclusion": "failure",
                    "run_url": run["html_url"],
                })),
            },
        )
        .await?;
    state
        .status
        .transition(
            incident.id,
            IncidentStatus::Processing,
            "CI failure detected",
            None,
        )
        .await?;
    spawn_pipeline(state, incident.id);

    Ok(Some(json!({
        "status": "activated",
        "incident_id": incident.id.to_string(),
        "message": "Activated existing MONITORING incident",
    })))
}

async fn handle_check_event(
    state: &Arc<ServerState>,
    payload: &Value,
    event: &str,
) -> ApiResult<Json<Value>> {
    let check = if event == "check_run" {
        &payload["check_run"]
    } else {
        &payload["check_suite"]
    };

    if check["conclusion"].as_str() != Some("failure") {
        return Ok(Json(json!({"status": "ignored", "reason": "not a failure"})));
    }

    let repo_url = payload["repository"]["html_url"].as_str().unwrap_or("");
    let name = check["name"].as_str().unwrap_or(event);
    let logs = format!(
        "Check failure via webhook\nCheck: {name}\nConclusion: failure\nDetails: {}",
        check["html_url"].as_str().unwrap_or(""),
    );

    if let Some(activated) = activate_monitoring_incident(state, repo_url, &logs, check).await? {
        return Ok(Json(activated));
    }

    let incident = Incident::from_create(IncidentCreate {
        title: format!("Check failure: {name}"),
        description: None,
        severity: Severity::High,
        source: IncidentSource::Ci,
        logs: Some(logs),
        repository: RepositoryRef::new(repo_url),
    });
    state.incidents().create(&incident).await?;
    spawn_pipeline(state, incident.id);

    Ok(Json(json!({
        "status": "created",
        "incident_id": incident.id.to_string(),
    })))
}

/// `POST /webhooks/datadog`: JSON alert payload.
pub async fn datadog_webhook(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let title = payload["title"]
        .as_str()
        .or_else(|| payload["alert_title"].as_str())
        .unwrap_or("Datadog alert");
    let repo_url = payload["repository"].as_str().unwrap_or("");
    let logs = payload["body"]
        .as_str()
        .or_else(|| payload["event_msg"].as_str())
        .map(String::from);

    if repo_url.is_empty() {
        return Ok(Json(json!({
            "status": "ignored",
            "reason": "alert carries no repository reference",
        })));
    }

    let incident = Incident::from_create(IncidentCreate {
        title: format!("Monitoring alert: {title}"),
        description: None,
        severity: Severity::High,
        source: IncidentSource::Monitoring,
        logs,
        repository: RepositoryRef::new(repo_url),
    });
    state.incidents().create(&incident).await?;

    if neverdown_models::logs_are_actionable(incident.logs.as_deref()) {
        spawn_pipeline(&state, incident.id);
    } else {
        state
            .status
            .transition(
                incident.id,
                IncidentStatus::Monitoring,
                "Monitoring via webhooks",
                None,
            )
            .await?;
    }

    Ok(Json(json!({
        "status": "created",
        "incident_id": incident.id.to_string(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"action": "completed"}"#;
        let signature = sign(body, "webhook-secret");
        assert!(verify_github_signature(body, &signature, "webhook-secret"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"action": "completed"}"#;
        let signature = sign(body, "webhook-secret");
        assert!(!verify_github_signature(body, &signature, "other-secret"));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign(br#"{"action": "completed"}"#, "webhook-secret");
        assert!(!verify_github_signature(
            br#"{"action": "requested"}"#,
            &signature,
            "webhook-secret"
        ));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        assert!(!verify_github_signature(b"x", "md5=abcdef", "s"));
        assert!(!verify_github_signature(b"x", "sha256=not-hex!", "s"));
        assert!(!verify_github_signature(b"x", "", "s"));
    }
}
