//! Pull-request repository.

use super::{enum_from_str, enum_to_str};
use crate::StoreError;
use chrono::{DateTime, Utc};
use neverdown_models::{PrStatus, PullRequestRecord};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct PullRequestRow {
    id: Uuid,
    incident_id: Uuid,
    patch_id: Uuid,
    verification_id: Option<Uuid>,
    number: Option<i64>,
    url: Option<String>,
    head_branch: String,
    base_branch: String,
    title: String,
    body: String,
    labels: Json<Vec<String>>,
    status: String,
    created_at: DateTime<Utc>,
}

impl PullRequestRow {
    fn into_record(self) -> Result<PullRequestRecord, StoreError> {
        Ok(PullRequestRecord {
            id: self.id,
            incident_id: self.incident_id,
            patch_id: self.patch_id,
            verification_id: self.verification_id,
            number: self.number.and_then(|n| u64::try_from(n).ok()),
            url: self.url,
            head_branch: self.head_branch,
            base_branch: self.base_branch,
            title: self.title,
            body: self.body,
            labels: self.labels.0,
            status: enum_from_str::<PrStatus>(&self.status)?,
            created_at: self.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PullRequestRepository {
    pool: PgPool,
}

impl PullRequestRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, record: &PullRequestRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pull_requests (id, incident_id, patch_id, verification_id, number, \
             url, head_branch, base_branch, title, body, labels, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(record.id)
        .bind(record.incident_id)
        .bind(record.patch_id)
        .bind(record.verification_id)
        .bind(record.number.and_then(|n| i64::try_from(n).ok()))
        .bind(&record.url)
        .bind(&record.head_branch)
        .bind(&record.base_branch)
        .bind(&record.title)
        .bind(&record.body)
        .bind(Json(&record.labels))
        .bind(enum_to_str(&record.status))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_for_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Option<PullRequestRecord>, StoreError> {
        let row: Option<PullRequestRow> = sqlx::query_as(
            "SELECT id, incident_id, patch_id, verification_id, number, url, head_branch, \
             base_branch, title, body, labels, status, created_at FROM pull_requests \
             WHERE incident_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PullRequestRow::into_record).transpose()
    }
}
