//! Pipeline driver: clone → sanitize → detect → reason → verify → publish.
//!
//! Stages run strictly sequentially within one incident; each reads the
//! previous stage's artifact from the in-memory context. Both working
//! trees (original clone and sanitized copy) are owned by the pipeline
//! task and removed on exit regardless of outcome.

use crate::git::GitService;
use crate::state::StatusWriter;
use neverdown_agents::detective::{Detective, DetectiveInput};
use neverdown_agents::publisher::{PublishInput, Publisher};
use neverdown_agents::reasoner::Reasoner;
use neverdown_agents::sanitizer::Sanitizer;
use neverdown_agents::verifier::Verifier;
use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_config::Settings;
use neverdown_models::{
    logs_are_actionable, DetectiveReport, Incident, IncidentStatus, VerificationResult,
    VerificationStatus,
};
use neverdown_store::{
    AnalysisRepository, AuditLog, IncidentRepository, PatchRepository, PullRequestRepository,
    VerificationRepository,
};
use sqlx::PgPool;
use std::path::PathBuf;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Mutable context threaded through the stages of one run.
#[derive(Default)]
struct PipelineContext {
    original_path: Option<PathBuf>,
    sanitized_path: Option<PathBuf>,
    logs: Option<String>,
    detective_report: Option<DetectiveReport>,
}

/// Coordinates the five agents for an incident.
pub struct Orchestrator {
    settings: Settings,
    pool: PgPool,
    status: StatusWriter,
    audit: AuditLog,
}

impl Orchestrator {
    #[must_use]
    pub fn new(settings: Settings, pool: PgPool) -> Self {
        Self {
            status: StatusWriter::new(pool.clone()),
            audit: AuditLog::new(pool.clone()),
            settings,
            pool,
        }
    }

    /// Run the full pipeline for an incident. Returns `true` when a PR
    /// was opened and the incident is awaiting review.
    pub async fn process_incident(&self, incident_id: Uuid) -> bool {
        let incidents = IncidentRepository::new(self.pool.clone());
        let incident = match incidents.get(incident_id).await {
            Ok(incident) => incident,
            Err(e) => {
                error!(%incident_id, "Cannot load incident: {e}");
                return false;
            }
        };

        let mut context = PipelineContext {
            logs: incident.logs.clone(),
            ..PipelineContext::default()
        };

        let outcome = self.run_stages(&incident, &mut context).await;

        self.cleanup(&context);

        match outcome {
            Ok(()) => true,
            Err(failure) => {
                self.record_failure(incident_id, &failure).await;
                false
            }
        }
    }

    async fn run_stages(
        &self,
        incident: &Incident,
        context: &mut PipelineContext,
    ) -> Result<(), AgentFailure> {
        let incident_id = incident.id;
        let repo_url = &incident.repository.url;

        self.update(incident_id, IncidentStatus::Processing, "Starting incident processing")
            .await;

        // Clone
        self.update(incident_id, IncidentStatus::Processing, "Cloning repository")
            .await;
        let git = GitService::new(&self.settings);
        let original = git
            .clone_repository(repo_url, incident_id, Some(&incident.repository.branch))
            .await?;
        context.original_path = Some(original.clone());

        // Supplement missing logs from the repo's failed CI runs
        if !logs_are_actionable(context.logs.as_deref()) {
            if let Some(fetched) = self.fetch_actions_logs(repo_url).await {
                info!(chars = fetched.len(), "Fetched GitHub Actions logs");
                IncidentRepository::new(self.pool.clone())
                    .set_logs(incident_id, &fetched)
                    .await
                    .ok();
                context.logs = Some(fetched);
            }
        }

        // Sanitizer
        self.update(incident_id, IncidentStatus::Processing, "Sanitizing repository")
            .await;
        let sanitizer = Sanitizer::new(&self.settings);
        let sanitize_outcome = match sanitizer.sanitize(&original, incident_id) {
            Ok(outcome) => outcome,
            Err(failure) => {
                if failure.code == ErrorCode::TooManySecrets {
                    self.audit
                        .security_event(
                            Some(incident_id),
                            "too_many_secrets",
                            "critical",
                            failure.details.clone(),
                        )
                        .await;
                }
                return Err(failure);
            }
        };
        context.sanitized_path = Some(sanitize_outcome.sanitized_path.clone());
        self.save_analysis(incident_id, "sanitizer", &sanitize_outcome.report, 1.0)
            .await;
        self.audit
            .agent_execution(
                incident_id,
                "sanitizer",
                true,
                serde_json::json!({
                    "files_scanned": sanitize_outcome.report.total_files_scanned,
                    "secrets_found": sanitize_outcome.report.total_secrets_found,
                }),
            )
            .await;

        // Detective
        self.update(incident_id, IncidentStatus::Processing, "Analyzing failure")
            .await;
        let detective = Detective::new();
        let detective_input = DetectiveInput {
            logs: context.logs.clone(),
            stack_trace: None,
            ci_output: None,
        };
        let report = detective
            .analyze(incident_id, &sanitize_outcome.sanitized_path, &detective_input)
            .await?;

        if report.errors.is_empty() && report.suspected_files.is_empty() {
            return Err(AgentFailure::new(
                ErrorCode::DetectiveError,
                "no errors or suspect files could be derived from the logs",
            ));
        }
        self.save_analysis(incident_id, "detective", &report, report.overall_confidence)
            .await;
        self.audit
            .agent_execution(
                incident_id,
                "detective",
                true,
                serde_json::json!({
                    "errors": report.errors.len(),
                    "suspects": report.suspected_files.len(),
                    "category": report.failure_category.as_str(),
                }),
            )
            .await;
        context.detective_report = Some(report);

        self.reason_verify_publish(incident, context, None).await
    }

    /// Reasoner → Verifier → Publisher. Shared between the default
    /// pipeline and the refinement loop; `existing_branch` switches the
    /// Publisher into append mode.
    async fn reason_verify_publish(
        &self,
        incident: &Incident,
        context: &mut PipelineContext,
        existing_branch: Option<&str>,
    ) -> Result<(), AgentFailure> {
        let incident_id = incident.id;
        let sanitized_path = context
            .sanitized_path
            .clone()
            .ok_or_else(|| AgentFailure::new(ErrorCode::ReasonerError, "sanitized tree missing"))?;
        let report = context
            .detective_report
            .clone()
            .ok_or_else(|| AgentFailure::new(ErrorCode::ReasonerError, "detective report missing"))?;

        // Reasoner
        self.update(incident_id, IncidentStatus::Processing, "Generating fix with LLM")
            .await;
        let reasoner = Reasoner::from_settings(&self.settings)?;
        let output = reasoner.generate(incident_id, &sanitized_path, &report).await?;

        PatchRepository::new(self.pool.clone())
            .create(&output.patch)
            .await
            .map_err(|e| {
                AgentFailure::new(ErrorCode::ReasonerError, format!("could not persist patch: {e}"))
            })?;
        self.save_analysis(incident_id, "reasoner", &output, output.confidence)
            .await;
        self.audit
            .agent_execution(
                incident_id,
                "reasoner",
                true,
                serde_json::json!({
                    "confidence": output.confidence,
                    "files_changed": output.patch.files_changed.len(),
                    "retries": output.patch.retry_count,
                }),
            )
            .await;

        // Verifier. A sandbox infrastructure failure degrades to a
        // no-tests result so the PR can still open (flagged needs-tests).
        self.update(incident_id, IncidentStatus::Processing, "Verifying fix in sandbox")
            .await;
        let verifier = Verifier::new(&self.settings);
        let verification = match verifier
            .verify(incident_id, &sanitized_path, &output.patch)
            .await
        {
            Ok(result) => result,
            Err(failure) => {
                warn!(%incident_id, "Verification unavailable: {failure}");
                self.audit
                    .agent_execution(
                        incident_id,
                        "verifier",
                        false,
                        serde_json::json!({"error": failure.message}),
                    )
                    .await;
                VerificationResult::from_tests(incident_id, output.patch.id, Vec::new(), None)
            }
        };

        VerificationRepository::new(self.pool.clone())
            .create(&verification)
            .await
            .ok();
        PatchRepository::new(self.pool.clone())
            .mark_verified(
                output.patch.id,
                verification.status == VerificationStatus::Passed,
            )
            .await
            .ok();
        self.save_analysis(incident_id, "verifier", &verification, 1.0).await;

        if verification.status == VerificationStatus::Failed {
            return Err(AgentFailure::new(
                ErrorCode::TestFailed,
                verification
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "tests failed in sandbox".to_string()),
            ));
        }

        // Publisher
        self.update(incident_id, IncidentStatus::Processing, "Creating pull request")
            .await;
        let original_path = context
            .original_path
            .clone()
            .ok_or_else(|| AgentFailure::new(ErrorCode::GithubApiError, "original tree missing"))?;
        let publisher = Publisher::new(&self.settings);
        let publish_input = PublishInput {
            incident_id,
            original_repo_path: &original_path,
            patch: &output.patch,
            verification: &verification,
            repo_url: &incident.repository.url,
            root_cause_summary: &output.root_cause_summary,
        };

        if let Some(branch) = existing_branch {
            publisher.update_existing(&publish_input, branch).await?;
        } else {
            let record = publisher.publish(&publish_input).await?;
            PullRequestRepository::new(self.pool.clone())
                .create(&record)
                .await
                .ok();
            if let Some(url) = &record.url {
                IncidentRepository::new(self.pool.clone())
                    .set_pull_request(incident_id, url, &record.head_branch)
                    .await
                    .ok();
            }
        }

        self.update(
            incident_id,
            IncidentStatus::AwaitingReview,
            "PR created - awaiting human review",
        )
        .await;

        Ok(())
    }

    /// Re-run Reasoner → Verifier → Publisher with reviewer feedback,
    /// appending commits to the incident's existing branch.
    pub async fn run_refinement(
        &self,
        incident_id: Uuid,
        feedback_text: &str,
    ) -> Result<(), AgentFailure> {
        let incidents = IncidentRepository::new(self.pool.clone());
        let incident = incidents
            .get(incident_id)
            .await
            .map_err(|e| e.as_not_found().unwrap_or_else(|| {
                AgentFailure::new(ErrorCode::IncidentNotFound, e.to_string())
            }))?;

        if incident.feedback_iteration >= self.settings.refinement_max_iterations {
            return Err(AgentFailure::new(
                ErrorCode::MaxRetriesExceeded,
                format!(
                    "refinement limit of {} iterations reached",
                    self.settings.refinement_max_iterations
                ),
            ));
        }

        let existing_branch = incident.pr_branch.clone().ok_or_else(|| {
            AgentFailure::new(ErrorCode::InvalidPatch, "incident has no PR branch to refine")
        })?;

        self.update(
            incident_id,
            IncidentStatus::Processing,
            "Starting refinement with user feedback",
        )
        .await;

        let mut context = PipelineContext {
            logs: incident.logs.clone(),
            ..PipelineContext::default()
        };

        let outcome = self
            .run_refinement_stages(&incident, &mut context, &existing_branch, feedback_text)
            .await;

        self.cleanup(&context);

        match outcome {
            Ok(()) => {
                let iteration = incidents
                    .increment_feedback_iteration(incident_id)
                    .await
                    .unwrap_or(incident.feedback_iteration + 1);
                info!(%incident_id, iteration, "Refinement iteration complete");
                Ok(())
            }
            Err(failure) => {
                self.record_failure(incident_id, &failure).await;
                Err(failure)
            }
        }
    }

    async fn run_refinement_stages(
        &self,
        incident: &Incident,
        context: &mut PipelineContext,
        existing_branch: &str,
        feedback_text: &str,
    ) -> Result<(), AgentFailure> {
        let incident_id = incident.id;

        let git = GitService::new(&self.settings);
        let original = git
            .clone_repository(
                &incident.repository.url,
                incident_id,
                Some(&incident.repository.branch),
            )
            .await?;
        context.original_path = Some(original.clone());

        let sanitizer = Sanitizer::new(&self.settings);
        let sanitize_outcome = sanitizer.sanitize(&original, incident_id)?;
        context.sanitized_path = Some(sanitize_outcome.sanitized_path.clone());

        // The original analysis is the baseline; reviewer feedback and the
        // previous diff ride along as extra evidence
        let analyses = AnalysisRepository::new(self.pool.clone());
        let stored = analyses
            .latest(incident_id, "detective")
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                AgentFailure::new(
                    ErrorCode::DetectiveError,
                    "no detective report found for refinement",
                )
            })?;
        let mut report: DetectiveReport = serde_json::from_value(stored).map_err(|e| {
            AgentFailure::new(
                ErrorCode::DetectiveError,
                format!("stored detective report unreadable: {e}"),
            )
        })?;

        report
            .evidence
            .push(format!("USER FEEDBACK (refinement): {feedback_text}"));
        if let Ok(Some(previous)) = PatchRepository::new(self.pool.clone())
            .latest_for_incident(incident_id)
            .await
        {
            let diff_excerpt: String = previous.diff.chars().take(2000).collect();
            report
                .evidence
                .push(format!("PREVIOUS PATCH ATTEMPT:\n```diff\n{diff_excerpt}\n```"));
        }
        context.detective_report = Some(report);

        self.reason_verify_publish(incident, context, Some(existing_branch))
            .await
    }

    /// Best-effort fetch of the most recent failed GitHub Actions run's
    /// job/step markers and logs.
    async fn fetch_actions_logs(&self, repo_url: &str) -> Option<String> {
        use neverdown_agents::publisher::github::GithubClient;

        let (owner, repo) = GithubClient::parse_repo_url(repo_url).ok()?;
        let token = &self.settings.github_token;
        if token.is_empty() {
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .ok()?;
        let base = "https://api.github.com";
        let auth = format!("Bearer {}", token.expose());

        let runs: serde_json::Value = client
            .get(format!("{base}/repos/{owner}/{repo}/actions/runs"))
            .query(&[("status", "failure"), ("per_page", "5")])
            .header("Authorization", &auth)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "neverdown")
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;

        let run = runs.get("workflow_runs")?.as_array()?.first()?;
        let run_id = run.get("id")?.as_u64()?;

        let jobs: serde_json::Value = client
            .get(format!("{base}/repos/{owner}/{repo}/actions/runs/{run_id}/jobs"))
            .header("Authorization", &auth)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "neverdown")
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;

        let mut collected = Vec::new();
        for job in jobs.get("jobs")?.as_array()? {
            if job.get("conclusion").and_then(|c| c.as_str()) != Some("failure") {
                continue;
            }
            let job_name = job.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
            for step in job.get("steps").and_then(|s| s.as_array()).unwrap_or(&Vec::new()) {
                if step.get("conclusion").and_then(|c| c.as_str()) == Some("failure") {
                    let step_name = step.get("name").and_then(|n| n.as_str()).unwrap_or("unknown step");
                    collected.push(format!("=== JOB: {job_name} | STEP: {step_name} (FAILED) ==="));
                }
            }

            if let Some(job_id) = job.get("id").and_then(|i| i.as_u64()) {
                if let Ok(response) = client
                    .get(format!("{base}/repos/{owner}/{repo}/actions/jobs/{job_id}/logs"))
                    .header("Authorization", &auth)
                    .header("User-Agent", "neverdown")
                    .send()
                    .await
                {
                    if let Ok(text) = response.text().await {
                        let tail = if text.len() > 5000 {
                            let mut cut = text.len() - 5000;
                            while !text.is_char_boundary(cut) {
                                cut += 1;
                            }
                            format!("... [truncated] ...\n{}", &text[cut..])
                        } else {
                            text
                        };
                        collected.push(tail);
                    }
                }
            }
        }

        if collected.is_empty() {
            let name = run.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
            let branch = run.get("head_branch").and_then(|b| b.as_str()).unwrap_or("unknown");
            return Some(format!(
                "GitHub Actions workflow '{name}' failed on {branch} branch"
            ));
        }
        Some(collected.join("\n\n"))
    }

    async fn save_analysis<T: serde::Serialize>(
        &self,
        incident_id: Uuid,
        agent: &str,
        artifact: &T,
        confidence: f64,
    ) {
        match serde_json::to_value(artifact) {
            Ok(value) => {
                if let Err(e) = AnalysisRepository::new(self.pool.clone())
                    .save(incident_id, agent, &value, confidence)
                    .await
                {
                    warn!(%incident_id, agent, "Failed to persist analysis: {e}");
                }
            }
            Err(e) => warn!(%incident_id, agent, "Failed to serialize analysis: {e}"),
        }
    }

    async fn update(&self, incident_id: Uuid, status: IncidentStatus, detail: &str) {
        if let Err(e) = self.status.transition(incident_id, status, detail, None).await {
            warn!(%incident_id, "Status update rejected: {e}");
        }
    }

    async fn record_failure(&self, incident_id: Uuid, failure: &AgentFailure) {
        error!(%incident_id, code = failure.code.as_str(), "Pipeline failed: {}", failure.message);
        self.audit
            .record(
                Some(incident_id),
                neverdown_models::AuditEventKind::AgentExecution,
                serde_json::json!({
                    "outcome": "failed",
                    "code": failure.code.as_str(),
                    "message": failure.message,
                    "details": failure.details,
                }),
            )
            .await;
        if let Err(e) = self
            .status
            .transition(
                incident_id,
                IncidentStatus::Failed,
                failure.code.as_str(),
                Some(&failure.message),
            )
            .await
        {
            warn!(%incident_id, "Could not record FAILED status: {e}");
        }
    }

    /// Both working trees go away on every exit path.
    fn cleanup(&self, context: &PipelineContext) {
        if let Some(path) = &context.original_path {
            GitService::cleanup(path);
        }
        if let Some(path) = &context.sanitized_path {
            if path.exists() {
                if let Err(e) = std::fs::remove_dir_all(path) {
                    warn!(path = %path.display(), "Failed to remove sanitized tree: {e}");
                }
            }
        }
    }
}
