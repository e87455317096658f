//! Patch repository.

use crate::StoreError;
use chrono::{DateTime, Utc};
use neverdown_models::{FileChange, Patch, TokenUsage};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct PatchRow {
    id: Uuid,
    incident_id: Uuid,
    diff: String,
    reasoning: String,
    confidence: f64,
    assumptions: Json<Vec<String>>,
    files_changed: Json<Vec<FileChange>>,
    verified: bool,
    token_usage: Option<Json<TokenUsage>>,
    retry_count: i32,
    created_at: DateTime<Utc>,
}

impl From<PatchRow> for Patch {
    fn from(row: PatchRow) -> Self {
        Self {
            id: row.id,
            incident_id: row.incident_id,
            diff: row.diff,
            reasoning: row.reasoning,
            confidence: row.confidence,
            assumptions: row.assumptions.0,
            files_changed: row.files_changed.0,
            verified: row.verified,
            token_usage: row.token_usage.map(|j| j.0),
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

const SELECT_COLUMNS: &str = "id, incident_id, diff, reasoning, confidence, assumptions, \
     files_changed, verified, token_usage, retry_count, created_at";

#[derive(Clone)]
pub struct PatchRepository {
    pool: PgPool,
}

impl PatchRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, patch: &Patch) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO patches (id, incident_id, diff, reasoning, confidence, assumptions, \
             files_changed, verified, token_usage, retry_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(patch.id)
        .bind(patch.incident_id)
        .bind(&patch.diff)
        .bind(&patch.reasoning)
        .bind(patch.confidence)
        .bind(Json(&patch.assumptions))
        .bind(Json(&patch.files_changed))
        .bind(patch.verified)
        .bind(patch.token_usage.as_ref().map(Json))
        .bind(i32::try_from(patch.retry_count).unwrap_or_default())
        .bind(patch.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Patch, StoreError> {
        let row: Option<PatchRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM patches WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Patch::from)
            .ok_or_else(|| StoreError::not_found("patch", id))
    }

    /// Newest patch for an incident; the refinement loop quotes its diff.
    pub async fn latest_for_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Option<Patch>, StoreError> {
        let row: Option<PatchRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM patches WHERE incident_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Patch::from))
    }

    pub async fn mark_verified(&self, id: Uuid, verified: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE patches SET verified = $2 WHERE id = $1")
            .bind(id)
            .bind(verified)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("patch", id));
        }
        Ok(())
    }
}
