//! Host orchestrator
//!
//! A deploy moves through `Idle → Verifying → Staging → Installing → Swapping → DrainingOld`.
//! Everything before Swapping works on `next/`, the shadow schema and a candidate service
//! group, so a failure there leaves the serving version untouched. Swapping replaces the
//! live handler, group and color in one critical section under the reload lock.

pub mod components;

use std::fs::File as StdFile;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::appconf::{self, AppConfig, ExecRemote};
use crate::deploy::fsm::{DeployEvent, DeployFsm, DeployStatus};
use crate::errors::HostError;
use crate::filesys::dir::Dir;
use crate::handler::{HandlerBuilder, HandlerContext, NoProjectHandler, RequestHandler};
use crate::keys::KeyStore;
use crate::package::{self, PackageDigest};
use crate::reload;
use crate::schema::{shadow_schema, SchemaStore};
use crate::srvman::{Color, Group};
use crate::storage::layout::{config_dir, sql_dir, AppLayout};

pub use components::{ActiveState, DrainComponent, ServingComponent};

/// Host options
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Live schema name
    pub app_schema: String,

    /// Bound on staging and installing one deploy
    pub deploy_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            app_schema: "app".to_string(),
            deploy_timeout: Duration::from_secs(300),
        }
    }
}

/// Collaborators supplied by the application layer
pub struct HostServices {
    pub schemas: Arc<dyn SchemaStore>,
    pub keys: Arc<dyn KeyStore>,
    pub handlers: Arc<dyn HandlerBuilder>,
}

/// A fully built version waiting to be swapped in
struct Candidate {
    handler: Arc<dyn RequestHandler>,
    group: Arc<Group>,
    color: Color,
    shadow: String,
}

/// Resolved address of a running service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub http_address: String,
    pub pid: Option<u32>,
}

/// Host state for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub color: Option<Color>,
    pub deploy: DeployStatus,
    pub services: Vec<ServiceStatus>,
}

/// Owns the serving state and the on-disk versions of one application
pub struct Host {
    layout: AppLayout,
    options: HostOptions,
    services: HostServices,
    active: Arc<RwLock<ActiveState>>,
    serving: Arc<ServingComponent>,
    drain: Arc<DrainComponent>,
    reload: reload::System,
    deploy_mutex: Mutex<()>,
    fsm: RwLock<DeployFsm>,
}

impl Host {
    pub async fn new(layout: AppLayout, options: HostOptions, services: HostServices) -> Arc<Host> {
        let active = Arc::new(RwLock::new(ActiveState {
            handler: Arc::new(NoProjectHandler),
            group: None,
            color: None,
        }));
        let serving = Arc::new(ServingComponent::new(active.clone()));
        let drain = Arc::new(DrainComponent::new());

        let reload = reload::System::new();
        reload.register(serving.clone()).await;
        reload.register(drain.clone()).await;

        Arc::new(Host {
            layout,
            options,
            services,
            active,
            serving,
            drain,
            reload,
            deploy_mutex: Mutex::new(()),
            fsm: RwLock::new(DeployFsm::new()),
        })
    }

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    pub fn keys(&self) -> &Arc<dyn KeyStore> {
        &self.services.keys
    }

    /// Load `current/` if it exists. Returns whether a version was loaded.
    ///
    /// Runs on its own task, so it completes even if the caller stops waiting.
    pub async fn boot(self: &Arc<Self>) -> Result<bool, HostError> {
        let host = self.clone();
        tokio::spawn(async move { host.load_current().await }).await?
    }

    async fn load_current(&self) -> Result<bool, HostError> {
        let _deploying = self.deploy_mutex.lock().await;

        let current = self.layout.current_dir();
        if !current.exists().await {
            info!("No application at {}, waiting for a deploy", current.path().display());
            return Ok(false);
        }

        self.transition(DeployEvent::Load).await;
        let result = async {
            let candidate = self.install(&current).await?;
            self.swap(candidate, false).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Loaded application from {}", current.path().display());
                Ok(true)
            }
            Err(e) => {
                self.transition(DeployEvent::Fail(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Verify, stage, install and swap in a signed package.
    ///
    /// `upload` is read from its start. Only one deploy runs at a time, and a deploy that
    /// started runs to completion on its own task even if the caller stops waiting.
    pub async fn deploy(
        self: &Arc<Self>,
        upload: StdFile,
        signature: Vec<u8>,
        trusted_keys: Vec<VerifyingKey>,
    ) -> Result<PackageDigest, HostError> {
        let host = self.clone();
        tokio::spawn(async move { host.deploy_locked(upload, signature, trusted_keys).await }).await?
    }

    async fn deploy_locked(
        &self,
        upload: StdFile,
        signature: Vec<u8>,
        trusted_keys: Vec<VerifyingKey>,
    ) -> Result<PackageDigest, HostError> {
        let _deploying = self.deploy_mutex.lock().await;

        self.transition(DeployEvent::Begin).await;
        match self.run_deploy(upload, signature, trusted_keys).await {
            Ok(digest) => {
                info!("Deployed package {}", digest);
                Ok(digest)
            }
            Err(e) => {
                if e.is_recoverable() {
                    warn!("Deploy aborted, serving version unchanged: {}", e);
                } else {
                    error!("Deploy failed after the swap point: {}", e);
                }
                self.transition(DeployEvent::Fail(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn run_deploy(
        &self,
        upload: StdFile,
        signature: Vec<u8>,
        trusted_keys: Vec<VerifyingKey>,
    ) -> Result<PackageDigest, HostError> {
        let (upload, digest) = tokio::task::spawn_blocking(move || {
            let mut upload = upload;
            upload.seek(SeekFrom::Start(0))?;
            let digest = package::verify(&mut upload, &signature, &trusted_keys)?;
            upload.seek(SeekFrom::Start(0))?;
            Ok::<_, HostError>((upload, digest))
        })
        .await?
        .map_err(HostError::into_stage_failure)?;
        self.transition(DeployEvent::Verified).await;

        let deadline = self.options.deploy_timeout;
        let candidate = tokio::time::timeout(deadline, self.stage_and_install(upload))
            .await
            .map_err(|_| {
                HostError::InstallFailure(format!("deploy did not finish within {:?}", deadline))
            })??;

        self.swap(candidate, true).await?;
        Ok(digest)
    }

    async fn stage_and_install(&self, upload: StdFile) -> Result<Candidate, HostError> {
        let next = self
            .layout
            .prepare_next()
            .await
            .map_err(HostError::into_stage_failure)?;

        let destination = next.path().to_path_buf();
        tokio::task::spawn_blocking(move || package::extract(upload, &destination))
            .await?
            .map_err(HostError::into_stage_failure)?;
        self.transition(DeployEvent::Staged).await;

        self.install(&next).await
    }

    /// Build a candidate version from an application tree without touching live state
    async fn install(&self, tree: &Dir) -> Result<Candidate, HostError> {
        let config = load_config(tree).await.map_err(HostError::into_install_failure)?;

        if let Some(exec) = config.exec_remote() {
            run_exec_remote(exec, tree.path())
                .await
                .map_err(HostError::into_install_failure)?;
        }

        let shadow = shadow_schema(&self.options.app_schema);
        self.services
            .schemas
            .install_code_package(&shadow, sql_dir(tree).path())
            .await
            .map_err(HostError::into_install_failure)?;

        let color = Color::next_after(self.active.read().await.color);
        let mut group = Group::new(config.services.clone()).map_err(HostError::into_install_failure)?;
        group
            .start(color)
            .await
            .map_err(HostError::into_install_failure)?;
        let group = Arc::new(group);

        let current = self.layout.current_dir();
        let built = self
            .services
            .handlers
            .build(HandlerContext {
                schema: &self.options.app_schema,
                install_schema: &shadow,
                config: &config,
                group: &group,
                root: current.path(),
            })
            .await;

        let handler = match built {
            Ok(handler) => handler,
            Err(e) => {
                stop_candidate(&group).await;
                return Err(e.into_install_failure());
            }
        };

        self.transition(DeployEvent::Installed).await;
        Ok(Candidate {
            handler,
            group,
            color,
            shadow,
        })
    }

    /// Swap the candidate in under the reload lock, then promote the schema and, for a
    /// deploy, rotate the version directories
    async fn swap(&self, candidate: Candidate, rotate: bool) -> Result<(), HostError> {
        let Candidate {
            handler,
            group,
            color,
            shadow,
        } = candidate;
        let live = self.options.app_schema.clone();
        let swapped = AtomicBool::new(false);

        let result = self
            .reload
            .reload(|| async {
                let previous = self.serving.replace(ActiveState {
                    handler,
                    group: Some(group.clone()),
                    color: Some(color),
                })?;
                swapped.store(true, Ordering::SeqCst);

                if let Some(old_group) = previous.group {
                    self.drain.retire(old_group)?;
                }

                self.services
                    .schemas
                    .promote(&shadow, &live)
                    .await
                    .map_err(|e| HostError::SwapFailure(format!("schema promotion failed: {}", e)))?;

                if rotate {
                    self.layout
                        .rotate()
                        .await
                        .map_err(|e| HostError::SwapFailure(format!("directory rotation failed: {}", e)))?;
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            if !swapped.load(Ordering::SeqCst) {
                stop_candidate(&group).await;
                return Err(e);
            }
            error!("Live state replaced but the swap did not complete: {}", e);
            return Err(match e {
                e @ HostError::SwapFailure(_) => e,
                other => HostError::SwapFailure(other.to_string()),
            });
        }

        self.transition(DeployEvent::Swapped).await;
        info!("Now serving {} ({} services)", color, group.services().len());
        self.transition(DeployEvent::Drained).await;
        Ok(())
    }

    /// Answer an application request with the active handler.
    ///
    /// The active state stays read-locked until the handler returns.
    pub async fn serve_request(&self, request: Request<Body>) -> Response {
        let active = self.active.read().await;
        match active.handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request handler failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }

    pub async fn color(&self) -> Option<Color> {
        self.active.read().await.color
    }

    pub async fn deploy_status(&self) -> DeployStatus {
        self.fsm.read().await.status()
    }

    pub async fn status(&self) -> HostStatus {
        let deploy = self.deploy_status().await;
        let active = self.active.read().await;
        let services = active
            .group
            .as_ref()
            .map(|group| {
                group
                    .services()
                    .iter()
                    .map(|service| ServiceStatus {
                        name: service.name().to_string(),
                        http_address: service.http_address().to_string(),
                        pid: service.pid(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        HostStatus {
            color: active.color,
            deploy,
            services,
        }
    }

    /// Stop the active service group and wait for superseded groups still draining
    pub async fn shutdown(&self) -> Result<(), HostError> {
        let group = self.active.read().await.group.clone();
        let result = match group {
            Some(group) => group.stop().await,
            None => Ok(()),
        };
        self.drain.wait_for_drains().await;
        result
    }

    async fn transition(&self, event: DeployEvent) {
        if let Err(e) = self.fsm.write().await.process(event) {
            warn!("Deploy state: {}", e);
        }
    }
}

async fn load_config(tree: &Dir) -> Result<AppConfig, HostError> {
    let dir = config_dir(tree).path().to_path_buf();
    tokio::task::spawn_blocking(move || appconf::load(&dir)).await?
}

async fn run_exec_remote(exec: &ExecRemote, working_dir: &Path) -> Result<(), HostError> {
    info!("Running exec-remote {} in {}", exec.cmd, working_dir.display());
    let status = Command::new(&exec.cmd)
        .args(&exec.args)
        .current_dir(working_dir)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| HostError::InstallFailure(format!("exec-remote {} failed to run: {}", exec.cmd, e)))?;

    if !status.success() {
        return Err(HostError::InstallFailure(format!(
            "exec-remote {} failed: {}",
            exec.cmd, status
        )));
    }
    Ok(())
}

async fn stop_candidate(group: &Group) {
    if let Err(e) = group.stop().await {
        error!("Failed to stop candidate service group: {}", e);
    }
}
