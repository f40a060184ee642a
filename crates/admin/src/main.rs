//! Transaction manager entry point.

use std::sync::Arc;

use admin::AppState;
use admin::config::Config;
use manager::Coordinator;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // Recovery runs inside spawn, so the log must be open first.
    let log = admin::open_log(&config)
        .await
        .expect("failed to open transaction log");
    let manager_config = config
        .manager_config()
        .expect("invalid manager configuration");
    let registry = admin::registry(&manager_config);
    let (manager, coordinator) = Coordinator::spawn(manager_config, log.clone(), &registry)
        .await
        .expect("failed to start coordinator");

    let state = Arc::new(AppState {
        manager: manager.clone(),
        log,
    });
    let app = admin::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting transaction manager");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if let Err(err) = manager.shutdown().await {
        tracing::warn!(error = %err, "coordinator already stopped");
    }
    if let Err(err) = coordinator.await {
        tracing::error!(error = %err, "coordinator task failed");
    }

    tracing::info!("transaction manager shut down gracefully");
}
