//! Incident repository.

use super::{enum_from_str, enum_to_str};
use crate::StoreError;
use chrono::{DateTime, Utc};
use neverdown_common::repo_url::urls_match;
use neverdown_models::{
    Incident, IncidentSource, IncidentStatus, RepositoryRef, Severity, TimelineEvent,
};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct IncidentRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    severity: String,
    source: String,
    status: String,
    error_message: Option<String>,
    logs: Option<String>,
    repo_url: String,
    repo_branch: String,
    repo_commit: Option<String>,
    timeline: Json<Vec<TimelineEvent>>,
    pr_url: Option<String>,
    pr_branch: Option<String>,
    feedback_iteration: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IncidentRow {
    fn into_incident(self) -> Result<Incident, StoreError> {
        Ok(Incident {
            id: self.id,
            title: self.title,
            description: self.description,
            severity: enum_from_str::<Severity>(&self.severity)?,
            source: enum_from_str::<IncidentSource>(&self.source)?,
            status: enum_from_str::<IncidentStatus>(&self.status)?,
            error_message: self.error_message,
            logs: self.logs,
            repository: RepositoryRef {
                url: self.repo_url,
                branch: self.repo_branch,
                commit: self.repo_commit,
            },
            timeline: self.timeline.0,
            pr_url: self.pr_url,
            pr_branch: self.pr_branch,
            feedback_iteration: u32::try_from(self.feedback_iteration).unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, title, description, severity, source, status, error_message, \
     logs, repo_url, repo_branch, repo_commit, timeline, pr_url, pr_branch, \
     feedback_iteration, created_at, updated_at";

/// CRUD and lifecycle mutations over the `incidents` table.
///
/// Every call checks its own connection out of the pool; status updates
/// issued while a pipeline transaction is failing still land.
#[derive(Clone)]
pub struct IncidentRepository {
    pool: PgPool,
}

impl IncidentRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO incidents (id, title, description, severity, source, status, \
             error_message, logs, repo_url, repo_branch, repo_commit, timeline, pr_url, \
             pr_branch, feedback_iteration, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(incident.id)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(enum_to_str(&incident.severity))
        .bind(enum_to_str(&incident.source))
        .bind(enum_to_str(&incident.status))
        .bind(&incident.error_message)
        .bind(&incident.logs)
        .bind(&incident.repository.url)
        .bind(&incident.repository.branch)
        .bind(&incident.repository.commit)
        .bind(Json(&incident.timeline))
        .bind(&incident.pr_url)
        .bind(&incident.pr_branch)
        .bind(i32::try_from(incident.feedback_iteration).unwrap_or_default())
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Incident, StoreError> {
        let row: Option<IncidentRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM incidents WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| StoreError::not_found("incident", id))?
            .into_incident()
    }

    pub async fn list(
        &self,
        status: Option<IncidentStatus>,
        severity: Option<Severity>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Incident>, StoreError> {
        let rows: Vec<IncidentRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM incidents \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR severity = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(status.map(|s| enum_to_str(&s)))
        .bind(severity.map(|s| enum_to_str(&s)))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncidentRow::into_incident).collect()
    }

    /// Write a status change. Callers go through the orchestrator's state
    /// machine so only validated transitions reach this method.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: IncidentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE incidents SET status = $2, \
             error_message = COALESCE($3, error_message), updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(enum_to_str(&status))
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("incident", id));
        }
        Ok(())
    }

    /// Append a timeline event to the incident's JSONB array.
    pub async fn append_timeline(&self, id: Uuid, event: &TimelineEvent) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE incidents SET timeline = timeline || $2::jsonb, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(Json(event))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("incident", id));
        }
        Ok(())
    }

    /// Replace the stored logs (used when a webhook activates a dormant
    /// sentinel with real CI output).
    pub async fn set_logs(&self, id: Uuid, logs: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE incidents SET logs = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(logs)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the open PR's URL and head branch.
    pub async fn set_pull_request(
        &self,
        id: Uuid,
        pr_url: &str,
        pr_branch: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE incidents SET pr_url = $2, pr_branch = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(pr_url)
        .bind(pr_branch)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the refinement counter, returning the new value.
    pub async fn increment_feedback_iteration(&self, id: Uuid) -> Result<u32, StoreError> {
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE incidents SET feedback_iteration = feedback_iteration + 1, updated_at = $2 \
             WHERE id = $1 RETURNING feedback_iteration",
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        let (value,) = row.ok_or_else(|| StoreError::not_found("incident", id))?;
        Ok(u32::try_from(value).unwrap_or_default())
    }

    /// Most recent `MONITORING` incident whose repository matches `repo_url`
    /// up to canonicalisation.
    pub async fn latest_monitoring_for_repo(
        &self,
        repo_url: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let rows: Vec<IncidentRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM incidents WHERE status = 'monitoring' \
             ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let incident = row.into_incident()?;
            if urls_match(&incident.repository.url, repo_url) {
                return Ok(Some(incident));
            }
        }
        Ok(None)
    }

    /// Delete an incident. Cascades to patches, verifications, PRs and
    /// audit rows. External admin path only; the pipeline never deletes.
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM incidents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("incident", id));
        }
        Ok(())
    }
}
