mod broadcast;
mod config;
mod csv_io;
mod db;
mod error;
mod gateway;
mod middleware;
mod models;
mod notify;
mod phone;
mod quick_context;
mod routes;
mod settings;

use std::sync::Arc;

use crate::{broadcast::BroadcastState, config::Config, models::AppState};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;

    let state = AppState {
        db: pool,
        api_key_hash: cfg.api_key_hash,
        operator_id: cfg.operator_id,
        broadcast: Arc::new(BroadcastState::default()),
    };

    // Allow the static frontend (browser/WebView) to call the API.
    // Without this, OPTIONS preflight returns 405 and blocks POSTs.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
