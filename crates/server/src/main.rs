//! NeverDown API server.
//!
//! Event-driven ingress: webhook and API callers get synchronous
//! responses while pipeline runs execute as spawned tasks.

mod error;
mod middleware;
mod routes;
mod server;

use anyhow::Result;
use clap::Parser;
use neverdown_config::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "neverdown-server", about = "Autonomous incident remediation API")]
struct Args {
    /// Bind host (overrides NEVERDOWN_API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides NEVERDOWN_API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Emit JSON logs instead of human-readable output
    #[arg(long, env = "NEVERDOWN_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut settings = Settings::from_env()?;
    if let Some(host) = args.host {
        settings.api_host = host;
    }
    if let Some(port) = args.port {
        settings.api_port = port;
    }

    let pool = neverdown_store::connect(
        settings.database_url.expose(),
        settings.database_max_connections,
    )
    .await?;
    info!("Database connected and migrated");

    let addr = format!("{}:{}", settings.api_host, settings.api_port);
    let state = std::sync::Arc::new(server::ServerState::new(settings, pool));
    server::run_server(state, &addr).await
}
