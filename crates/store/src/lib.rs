//! Postgres persistence for NeverDown.
//!
//! Repository-pattern structs own a [`sqlx::PgPool`] handle; each call
//! checks a connection out of the pool, so status updates made while a
//! pipeline is mid-flight never share a session with it. The audit sink
//! applies the recursive redaction pass to every payload before it is
//! written.

pub mod audit;
pub mod error;
pub mod repos;

pub use audit::AuditLog;
pub use error::StoreError;
pub use repos::{
    AnalysisRepository, IncidentRepository, PatchRepository, PullRequestRepository,
    VerificationRepository,
};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to Postgres and run pending migrations.
///
/// # Errors
///
/// Returns an error if the pool cannot be established or a migration fails.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
