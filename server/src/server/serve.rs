//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::deploy::DEPLOY_PATH;
use crate::errors::HostError;
use crate::server::handlers::{
    app_handler, deploy_handler, health_handler, status_handler, version_handler,
};
use crate::server::state::ServerState;

/// System routes plus the fallback to the active application handler
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Deploy
        .route(
            DEPLOY_PATH,
            post(deploy_handler).layer(DefaultBodyLimit::disable()),
        )
        // Health, version and status
        .route("/swaphost-system/health", get(health_handler))
        .route("/swaphost-system/version", get(version_handler))
        .route("/swaphost-system/status", get(status_handler))
        // Application
        .fallback(app_handler)
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), HostError>>, HostError> {
    let app = router(state);

    info!("Starting HTTP server on {}", options.listen_addr);

    let listener = TcpListener::bind(&options.listen_addr)
        .await
        .map_err(|e| HostError::ServerError(format!("bind {}: {}", options.listen_addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| HostError::ServerError(e.to_string()))
    });

    Ok(handle)
}
