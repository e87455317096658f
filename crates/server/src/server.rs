//! Server state and router assembly.

use crate::{middleware, routes};
use anyhow::Result;
use axum::routing::{delete, get, post};
use axum::Router;
use neverdown_config::Settings;
use neverdown_orchestrator::{Orchestrator, StatusWriter};
use neverdown_store::{AnalysisRepository, AuditLog, IncidentRepository};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state handed to every handler.
pub struct ServerState {
    pub settings: Settings,
    pub pool: PgPool,
    pub status: StatusWriter,
    pub audit: AuditLog,
    pub rate_limiter: middleware::RateLimiter,
    pub deliveries: middleware::DeliveryLedger,
}

impl ServerState {
    #[must_use]
    pub fn new(settings: Settings, pool: PgPool) -> Self {
        Self {
            status: StatusWriter::new(pool.clone()),
            audit: AuditLog::new(pool.clone()),
            rate_limiter: middleware::RateLimiter::default(),
            deliveries: middleware::DeliveryLedger::default(),
            settings,
            pool,
        }
    }

    pub fn incidents(&self) -> IncidentRepository {
        IncidentRepository::new(self.pool.clone())
    }

    pub fn analyses(&self) -> AnalysisRepository {
        AnalysisRepository::new(self.pool.clone())
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.settings.clone(), self.pool.clone())
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/incidents", post(routes::incidents::create_incident))
        .route("/incidents", get(routes::incidents::list_incidents))
        .route("/incidents/{id}", get(routes::incidents::get_incident))
        .route("/incidents/{id}", delete(routes::incidents::delete_incident))
        .route("/incidents/{id}/retry", post(routes::incidents::retry_incident))
        .route("/incidents/{id}/feedback", post(routes::incidents::submit_feedback))
        .route(
            "/incidents/{id}/{agent}",
            get(routes::incidents::get_stage_artifact),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ));

    Router::new()
        .merge(api)
        .route("/webhooks/github", post(routes::webhooks::github_webhook))
        .route("/webhooks/datadog", post(routes::webhooks::datadog_webhook))
        .route("/auth/github/login", get(routes::auth::github_login))
        .route("/auth/github/callback", get(routes::auth::github_callback))
        .route("/health", get(routes::health::health))
        .route("/health/live", get(routes::health::live))
        .route("/health/ready", get(routes::health::ready))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn run_server(state: Arc<ServerState>, addr: &str) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("NeverDown API listening on {addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
