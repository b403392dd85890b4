//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::errors::HostError;
use crate::handler::ProxyHandlerBuilder;
use crate::host::{Host, HostServices};
use crate::keys::FileKeyStore;
use crate::schema::PgSchemaStore;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::layout::AppLayout;

/// Run the swaphost server
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), HostError> {
    info!("Initializing swaphost...");

    let host = init_host(&options).await?;
    run_host(host, options, shutdown_signal).await
}

/// Boot an already assembled host, serve it and shut it down on `shutdown_signal`
pub async fn run_host(
    host: Arc<Host>,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), HostError> {
    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(
        shutdown_tx.clone(),
        options.lifecycle.clone(),
        host.clone(),
    );

    if let Err(e) = host.boot().await {
        error!("Failed to load the current application, serving without one: {}", e);
    }

    if let Err(e) = init_server(&options, host, &mut shutdown_manager, shutdown_tx.subscribe()).await {
        error!("Failed to start swaphost: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init_host(options: &AppOptions) -> Result<Arc<Host>, HostError> {
    let layout = AppLayout::new(&options.app_path);
    layout.setup().await?;

    let keys = FileKeyStore::new(&options.keys_file).await?;
    let schemas = PgSchemaStore::connect(&options.database_url).await?;

    let host = Host::new(
        layout,
        options.host.clone(),
        HostServices {
            schemas: Arc::new(schemas),
            keys: Arc::new(keys),
            handlers: Arc::new(ProxyHandlerBuilder::new()),
        },
    )
    .await;

    Ok(host)
}

async fn init_server(
    options: &AppOptions,
    host: Arc<Host>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), HostError> {
    info!("Initializing HTTP server...");

    let server_handle = serve(&options.server, Arc::new(ServerState::new(host)), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    host: Arc<Host>,
    server_handle: Option<JoinHandle<Result<(), HostError>>>,
}

impl ShutdownManager {
    pub fn new(
        shutdown_tx: broadcast::Sender<()>,
        lifecycle_options: LifecycleOptions,
        host: Arc<Host>,
    ) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            host,
            server_handle: None,
        }
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), HostError>>,
    ) -> Result<(), HostError> {
        if self.server_handle.is_some() {
            return Err(HostError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    /// Stop the listener and the active service group within the shutdown delay
    pub async fn shutdown(&mut self) -> Result<(), HostError> {
        let _ = self.shutdown_tx.send(());

        let delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Graceful shutdown did not finish within {:?}", delay);
                Err(HostError::ShutdownError(format!(
                    "graceful shutdown did not finish within {:?}",
                    delay
                )))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), HostError> {
        info!("Shutting down swaphost...");

        let server_handle = self.server_handle.take();
        let server = async move {
            match server_handle {
                Some(handle) => handle
                    .await
                    .map_err(|e| HostError::ShutdownError(e.to_string()))?,
                None => Ok(()),
            }
        };
        let (server_result, host_result) = tokio::join!(server, self.host.shutdown());

        server_result?;
        host_result?;

        info!("Shutdown complete");
        Ok(())
    }
}
