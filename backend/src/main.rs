mod api;
mod config;
mod dataset;
mod db;
mod errors;
mod models;
mod protocols;
mod roster;
mod rows;
mod service;
mod state;

use crate::config::DcConfig;
use crate::errors::ApiError;
use crate::state::AppState;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config = DcConfig::from_env();

    // Roster keys and the sqlite file live under the data dir (ignored by git).
    std::fs::create_dir_all(&config.data_dir).map_err(|_| ApiError::Internal)?;

    let db_path = config.data_dir.join("dc.sqlite");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.to_string_lossy());

    let db = db::connect(&db_url).await?;
    db::init_schema(&db).await?;

    let state = AppState::new(db, config.clone()).await?;

    if config.seed_rows > 0 && db::count_rows(&state.db).await? == 0 {
        let rows = dataset::seed(&state.service, config.seed_rows).await?;
        tracing::info!(rows, "synthetic rows seeded");
    }

    let sweep_every = (config.query_ttl / 4).max(Duration::from_secs(1));
    service::spawn_sweeper(state.service.clone(), sweep_every);

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .map_err(|_| ApiError::Internal)?;

    tracing::info!(addr = %config.addr, servers = config.roster_size, "backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .map_err(|_| ApiError::Internal)?;

    Ok(())
}
