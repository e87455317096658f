//! Per-agent artifact blobs.
//!
//! Each stage persists its full output as JSON under its agent name. The
//! API's stage-artifact routes and the refinement loop read these back.

use crate::StoreError;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct AnalysisRepository {
    pool: PgPool,
}

impl AnalysisRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store an agent's artifact for an incident.
    pub async fn save(
        &self,
        incident_id: Uuid,
        agent: &str,
        output: &serde_json::Value,
        confidence: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO analyses (id, incident_id, agent, output, confidence, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(incident_id)
        .bind(agent)
        .bind(Json(output))
        .bind(confidence)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest artifact stored by `agent` for this incident.
    pub async fn latest(
        &self,
        incident_id: Uuid,
        agent: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row: Option<(Json<serde_json::Value>,)> = sqlx::query_as(
            "SELECT output FROM analyses WHERE incident_id = $1 AND agent = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(incident_id)
        .bind(agent)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(json,)| json.0))
    }
}
