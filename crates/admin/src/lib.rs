//! Transaction manager process.
//!
//! Wires a [`manager::Coordinator`] to the configured transaction log and
//! exposes a read-only HTTP view of it, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use manager::{ManagerConfig, ManagerHandle};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use transaction_log::{
    FileTransactionLog, InMemoryTransactionLog, PostgresTransactionLog, TransactionLog,
};
use xa::{InMemoryResourceManager, SwitchRegistry};

use config::{Config, ConfigError, LogBackend};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub manager: ManagerHandle,
    pub log: Arc<dyn TransactionLog>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/transactions", get(routes::admin::transactions))
        .route("/resources", get(routes::admin::resources))
        .route("/pending", get(routes::admin::pending))
        .route("/log", get(routes::admin::log))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Opens the transaction log the configuration asks for.
#[tracing::instrument(skip(config), fields(backend = ?config.log_backend))]
pub async fn open_log(config: &Config) -> Result<Arc<dyn TransactionLog>, ConfigError> {
    let log: Arc<dyn TransactionLog> = match config.log_backend {
        LogBackend::Memory => {
            tracing::warn!("transaction log is in memory, decisions will not survive a restart");
            Arc::new(InMemoryTransactionLog::new())
        }
        LogBackend::File => Arc::new(FileTransactionLog::open(&config.log_path).await?),
        LogBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::MissingDatabaseUrl)?;
            let pool = sqlx::PgPool::connect(url).await?;
            let log = PostgresTransactionLog::new(pool);
            log.run_migrations().await?;
            Arc::new(log)
        }
    };
    tracing::info!("transaction log opened");
    Ok(log)
}

/// Switches for the configured resource keys.
///
/// No database driver ships with the process, so every key is served by an
/// in-memory resource manager shared by all instances of that key.
pub fn registry(config: &ManagerConfig) -> SwitchRegistry {
    let mut registry = SwitchRegistry::new();
    for resource in &config.resources {
        if !registry.contains(&resource.key) {
            registry.register_in_memory(
                resource.key.clone(),
                InMemoryResourceManager::new(&resource.name),
            );
        }
    }
    registry
}
