//! REST API for student records, course enrollment and competency tracking.

use std::sync::Arc;

use anyhow::Context;
use shared::config::Settings;
use shared::db::PgStore;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging via RUST_LOG
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = Settings::new().unwrap_or_else(|e| {
        warn!(%e, "invalid settings in environment, using defaults");
        Settings::default()
    });

    let store = PgStore::connect(&settings)
        .await
        .context("connecting to Postgres")?;
    store.ensure_schema().await.context("ensuring schema")?;

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let app = routes::router(routes::AppState::new(Arc::new(store), settings));

    info!("starting student-api on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
