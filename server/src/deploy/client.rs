//! Client side of a deploy: package, sign and upload a project

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::header;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, error, info};
use url::Url;

use crate::deploy::keygen::signing_key_from_hex;
use crate::deploy::{AUTH_SCHEME, DEPLOY_PATH};
use crate::errors::HostError;
use crate::package::{Package, PackageStream};

/// File every application package must contain
pub const SQL_MANIFEST: &str = "sql/manifest.conf";

/// Chunks buffered between the package encoder and the request body
const STREAM_CAPACITY: usize = 16;

/// Uploads signed packages to a server
pub struct DeployClient {
    client: Client,
    url: Url,
    api_key: String,
    signing_key: SigningKey,
}

impl DeployClient {
    pub fn new(server_url: &str, api_key: &str, deploy_key_hex: &str) -> Result<Self, HostError> {
        if api_key.is_empty() {
            return Err(HostError::ConfigError("api key is missing".to_string()));
        }

        Ok(Self {
            client: Client::builder().build()?,
            url: deploy_url(server_url)?,
            api_key: api_key.to_string(),
            signing_key: signing_key_from_hex(deploy_key_hex)?,
        })
    }

    /// Endpoint packages are posted to
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Package `project`, stream it to the server and return the response body.
    ///
    /// The package is produced while it is uploaded; the signature part follows once the
    /// digest is known.
    pub async fn deploy(&self, project: impl Into<PathBuf>) -> Result<String, HostError> {
        let project = project.into();
        let package = tokio::task::spawn_blocking(move || Package::scan(project)).await??;
        if !package.contains(SQL_MANIFEST) {
            return Err(HostError::InvalidPackage(format!(
                "{} is not an application package: missing {}",
                package.root().display(),
                SQL_MANIFEST
            )));
        }

        info!(
            "Deploying {} ({} entries) to {}",
            package.root().display(),
            package.entries().len(),
            self.url
        );

        let PackageStream { chunks, summary } = package.stream(STREAM_CAPACITY);

        let signing_key = self.signing_key.clone();
        let signature = futures::stream::once(async move {
            let summary = summary
                .await
                .map_err(|_| io::Error::other("package encoder stopped"))?
                .map_err(|e| io::Error::other(e.to_string()))?;
            debug!("Signing package digest {} ({} bytes)", summary.digest, summary.size);
            let signature = signing_key.sign(summary.digest.as_bytes());
            Ok::<_, io::Error>(Bytes::from(hex::encode(signature.to_bytes())))
        });

        let form = Form::new()
            .part(
                "pkg",
                Part::stream(reqwest::Body::wrap_stream(chunks))
                    .file_name("pkg.tar.gz")
                    .mime_str("application/gzip")?,
            )
            .part("signature", Part::stream(reqwest::Body::wrap_stream(signature)));

        let response = self
            .client
            .post(self.url.clone())
            .header(header::AUTHORIZATION, format!("{} {}", AUTH_SCHEME, self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!("Deploy failed: {} - {}", status, body);
            return Err(HostError::ServerError(format!("HTTP {} {}", status.as_u16(), body)));
        }

        info!("Deploy accepted: {}", status);
        Ok(body)
    }
}

/// Append the deploy path to a server URL, keeping any path prefix it already has
pub fn deploy_url(server_url: &str) -> Result<Url, HostError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| HostError::ConfigError(format!("invalid deploy url: {}", e)))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), DEPLOY_PATH);
    url.set_path(&path);
    Ok(url)
}
