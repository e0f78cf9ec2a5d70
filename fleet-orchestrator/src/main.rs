use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use fleet_orchestrator::credentials::{EnvSecretResolver, PgSecretResolver, SecretResolver};
use fleet_orchestrator::settings::SecretSource;
use fleet_orchestrator::store::PgFleetStore;
use fleet_orchestrator::{Engine, ProviderRegistry, Settings, VendorFactory};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct AppState {
    db: Pool<Postgres>,
    engine: Arc<Engine>,
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "database": db_ok,
            "cached_providers": state.engine.registry().cached_len(),
        })),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    tracing::info!("[Startup] connected to database");

    sqlx::migrate!("../sqlx-migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let secrets: Arc<dyn SecretResolver> = match settings.secret_source {
        SecretSource::Database => Arc::new(PgSecretResolver::new(pool.clone())),
        SecretSource::Env => Arc::new(EnvSecretResolver),
    };
    let registry = Arc::new(ProviderRegistry::new(secrets, Arc::new(VendorFactory)));
    let store = Arc::new(PgFleetStore::new(pool.clone()));
    let engine = Arc::new(Engine::new(registry, store, settings.engine.clone()));
    tracing::info!(
        "[Startup] engine ready batch_max={} expand_retry={} repair_attempts={}",
        settings.engine.batch_max,
        settings.engine.expand_retry,
        settings.engine.repair_attempts
    );

    let state = Arc::new(AppState { db: pool, engine });
    let app = Router::new()
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    tracing::info!("[Startup] listening on {}", settings.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
