use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use staffroom::{AppState, config::Config, db, rooms, rooms::registry::RoomRegistry};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "staffroom=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    db::setup(&db_pool).await?;

    let app_state = AppState {
        db_pool,
        registry: Arc::new(RoomRegistry::new(config.history_cap)),
    };

    // the dashboard frontend is served from another origin
    let app = Router::new()
        .nest("/api/chat", rooms::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive());

    tracing::info!(addr = %config.addr, history_cap = config.history_cap, "staffroom listening");
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
