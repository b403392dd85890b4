//! Shared fixtures: in-memory collaborators, project trees and signed packages

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use ed25519_dalek::{Signer, SigningKey};
use swaphost::errors::HostError;
use swaphost::handler::{HandlerBuilder, HandlerContext, RequestHandler};
use swaphost::host::{Host, HostOptions, HostServices};
use swaphost::keys::{FileKeyStore, KeyFile, UserKeys};
use swaphost::package::Package;
use swaphost::schema::SchemaStore;
use swaphost::storage::layout::AppLayout;
use tempfile::TempDir;

pub const API_KEY: &str = "test-api-key";
pub const USER_ID: &str = "alice";

/// Records schema operations instead of running them
#[derive(Default)]
pub struct RecordingSchemas {
    pub calls: Mutex<Vec<String>>,
    pub fail_install: AtomicBool,
    pub fail_promote: AtomicBool,
    /// Milliseconds each promotion takes
    pub promote_delay_ms: AtomicU64,
}

impl RecordingSchemas {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaStore for RecordingSchemas {
    async fn install_code_package(&self, schema: &str, sql_dir: &Path) -> Result<(), HostError> {
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(HostError::DatabaseError(sqlx::Error::PoolClosed));
        }
        assert!(sql_dir.join("manifest.conf").exists());
        self.calls.lock().unwrap().push(format!("install {}", schema));
        Ok(())
    }

    async fn promote(&self, shadow: &str, live: &str) -> Result<(), HostError> {
        let delay = self.promote_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_promote.load(Ordering::SeqCst) {
            return Err(HostError::DatabaseError(sqlx::Error::PoolClosed));
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("promote {} -> {}", shadow, live));
        Ok(())
    }
}

/// Answers every request with the `VERSION` file of the served tree
pub struct VersionHandler {
    root: PathBuf,
}

#[async_trait]
impl RequestHandler for VersionHandler {
    async fn handle(&self, _request: Request<Body>) -> Result<Response, HostError> {
        let version = tokio::fs::read_to_string(self.root.join("VERSION")).await?;
        Ok((StatusCode::OK, version.trim().to_string()).into_response())
    }
}

pub struct VersionHandlers;

#[async_trait]
impl HandlerBuilder for VersionHandlers {
    async fn build(&self, context: HandlerContext<'_>) -> Result<Arc<dyn RequestHandler>, HostError> {
        Ok(Arc::new(VersionHandler {
            root: context.root.to_path_buf(),
        }))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub host: Arc<Host>,
    pub schemas: Arc<RecordingSchemas>,
    pub signing_key: SigningKey,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_deploy_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_deploy_timeout(deploy_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);

        let keys = KeyFile {
            users: vec![UserKeys {
                id: USER_ID.to_string(),
                api_keys: vec![API_KEY.to_string()],
                deploy_keys: vec![hex::encode(signing_key.verifying_key().to_bytes())],
                revoked_deploy_keys: vec![],
            }],
        };

        let layout = AppLayout::new(dir.path().join("app"));
        layout.setup().await.unwrap();

        let schemas = Arc::new(RecordingSchemas::default());
        let host = Host::new(
            layout,
            HostOptions {
                app_schema: "app".to_string(),
                deploy_timeout,
            },
            HostServices {
                schemas: schemas.clone(),
                keys: Arc::new(FileKeyStore::from_keys(keys)),
                handlers: Arc::new(VersionHandlers),
            },
        )
        .await;

        Self {
            dir,
            host,
            schemas,
            signing_key,
        }
    }

    pub fn app_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join("app").join(name)
    }

    /// Write a minimal application tree and return its root
    pub fn project(&self, version: &str, config: &str) -> PathBuf {
        let root = self.dir.path().join(format!("project-{}", version));
        std::fs::create_dir_all(root.join("config")).unwrap();
        std::fs::create_dir_all(root.join("sql")).unwrap();
        std::fs::write(root.join("VERSION"), version).unwrap();
        std::fs::write(root.join("config/app.yml"), config).unwrap();
        std::fs::write(root.join("sql/manifest.conf"), "schema.sql\n").unwrap();
        std::fs::write(root.join("sql/schema.sql"), "create table t (id int);\n").unwrap();
        root
    }

    /// Serialize `root` into an anonymous file and sign its digest
    pub fn signed_package(&self, root: &Path) -> (std::fs::File, Vec<u8>) {
        sign_package(root, &self.signing_key)
    }

    pub async fn deploy(&self, version: &str, config: &str) -> Result<(), HostError> {
        let project = self.project(version, config);
        let (file, signature) = self.signed_package(&project);
        let keys = vec![self.signing_key.verifying_key()];
        self.host.deploy(file, signature, keys).await.map(|_| ())
    }

    pub async fn body(&self) -> (StatusCode, String) {
        let response = self.host.serve_request(Request::new(Body::empty())).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }
}

pub fn sign_package(root: &Path, signing_key: &SigningKey) -> (std::fs::File, Vec<u8>) {
    let package = Package::scan(root).unwrap();
    let mut file = tempfile::tempfile().unwrap();
    let summary = package.write_to(&mut file).unwrap();
    file.flush().unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let signature = signing_key.sign(summary.digest.as_bytes());
    (file, signature.to_bytes().to_vec())
}

pub const EMPTY_CONFIG: &str = "services: []\n";
