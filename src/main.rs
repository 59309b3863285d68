use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use jobserver::api_router::configure_api_routes;
use jobserver::config::AppConfig;
use jobserver::servicem8::sync::SyncService;
use jobserver::shared::state::AppState;
use jobserver::shared::utils::{create_conn, DbPool};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn run_migrations(pool: &DbPool) -> Result<(), anyhow::Error> {
    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("failed to run migrations: {}", e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;
    let pool = match create_conn(&config.database.url) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create database pool: {}", e);
            return Err(e.into());
        }
    };
    run_migrations(&pool)?;

    let app_state = Arc::new(AppState::new(config.clone(), pool));

    let sync_service = SyncService::new(app_state.clone());
    tokio::spawn(async move {
        sync_service.spawn().await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = configure_api_routes().layer(cors).with_state(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
