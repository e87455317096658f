//! Verification repository.

use super::{enum_from_str, enum_to_str};
use crate::StoreError;
use chrono::{DateTime, Utc};
use neverdown_models::{SandboxInfo, TestCaseResult, VerificationResult, VerificationStatus};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct VerificationRow {
    id: Uuid,
    incident_id: Uuid,
    patch_id: Uuid,
    status: String,
    tests_passed: i32,
    tests_failed: i32,
    tests_skipped: i32,
    tests: Json<Vec<TestCaseResult>>,
    failure_reason: Option<String>,
    sandbox: Option<Json<SandboxInfo>>,
    created_at: DateTime<Utc>,
}

impl VerificationRow {
    fn into_result(self) -> Result<VerificationResult, StoreError> {
        Ok(VerificationResult {
            id: self.id,
            incident_id: self.incident_id,
            patch_id: self.patch_id,
            status: enum_from_str::<VerificationStatus>(&self.status)?,
            tests_passed: u32::try_from(self.tests_passed).unwrap_or_default(),
            tests_failed: u32::try_from(self.tests_failed).unwrap_or_default(),
            tests_skipped: u32::try_from(self.tests_skipped).unwrap_or_default(),
            tests: self.tests.0,
            failure_reason: self.failure_reason,
            sandbox: self.sandbox.map(|j| j.0),
            created_at: self.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, incident_id, patch_id, status, tests_passed, tests_failed, \
     tests_skipped, tests, failure_reason, sandbox, created_at";

#[derive(Clone)]
pub struct VerificationRepository {
    pool: PgPool,
}

impl VerificationRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, result: &VerificationResult) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO verifications (id, incident_id, patch_id, status, tests_passed, \
             tests_failed, tests_skipped, tests, failure_reason, sandbox, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(result.id)
        .bind(result.incident_id)
        .bind(result.patch_id)
        .bind(enum_to_str(&result.status))
        .bind(i32::try_from(result.tests_passed).unwrap_or_default())
        .bind(i32::try_from(result.tests_failed).unwrap_or_default())
        .bind(i32::try_from(result.tests_skipped).unwrap_or_default())
        .bind(Json(&result.tests))
        .bind(&result.failure_reason)
        .bind(result.sandbox.as_ref().map(Json))
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_for_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Option<VerificationResult>, StoreError> {
        let row: Option<VerificationRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM verifications WHERE incident_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VerificationRow::into_result).transpose()
    }
}
