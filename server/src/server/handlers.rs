//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{multipart::Field, Multipart, Request, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::deploy::fsm::DeployStatus;
use crate::deploy::AUTH_SCHEME;
use crate::errors::HostError;
use crate::host::ServiceStatus;
use crate::server::state::ServerState;
use crate::srvman::Color;
use crate::trace;
use crate::utils::{parse_authorization, version_info};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "swaphost".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub color: Option<Color>,
    pub deploy: DeployStatus,
    pub services: Vec<ServiceStatus>,
}

/// Status handler
pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let status = state.host.status().await;
    Json(StatusResponse {
        color: status.color,
        deploy: status.deploy,
        services: status.services,
    })
}

/// Deploy response
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub digest: String,
    pub color: Option<Color>,
}

/// Deploy handler: authenticate, spool the package, verify and install it
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(user_id) => user_id,
        Err(e) => {
            error!("Deploy rejected: {} [{}]", e, trace!());
            return error_response(e);
        }
    };

    match deploy(&state, &user_id, multipart).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!("Deploy by user {} failed: {} [{}]", user_id, e, trace!());
            error_response(e)
        }
    }
}

/// Everything outside the system routes goes to the active application handler
pub async fn app_handler(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    state.host.serve_request(request).await
}

async fn authenticate(state: &ServerState, headers: &HeaderMap) -> Result<String, HostError> {
    let api_key = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_authorization(value, AUTH_SCHEME))
        .ok_or_else(|| HostError::Unauthorized("missing or malformed authorization".to_string()))?;

    state
        .host
        .keys()
        .authenticate(api_key)
        .await?
        .ok_or_else(|| HostError::Unauthorized("unknown api key".to_string()))
}

async fn deploy(
    state: &ServerState,
    user_id: &str,
    mut multipart: Multipart,
) -> Result<DeployResponse, HostError> {
    let mut upload = None;
    let mut signature = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| HostError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("pkg") => upload = Some(spool(field).await?),
            Some("signature") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| HostError::BadRequest(format!("unreadable signature: {}", e)))?;
                let bytes = hex::decode(text.trim())
                    .map_err(|e| HostError::BadRequest(format!("signature must be hex encoded: {}", e)))?;
                signature = Some(bytes);
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| HostError::BadRequest("missing pkg part".to_string()))?;
    let signature =
        signature.ok_or_else(|| HostError::BadRequest("missing signature field".to_string()))?;

    let trusted_keys = state.host.keys().deploy_keys(user_id).await?;
    info!(
        "Deploy requested by user {} ({} trusted keys)",
        user_id,
        trusted_keys.len()
    );

    let digest = state.host.deploy(upload, signature, trusted_keys).await?;
    Ok(DeployResponse {
        digest: digest.to_hex(),
        color: state.host.color().await,
    })
}

/// Write a multipart field to an anonymous temporary file
async fn spool(mut field: Field<'_>) -> Result<std::fs::File, HostError> {
    let spooled = tokio::task::spawn_blocking(tempfile::tempfile).await??;
    let mut file = tokio::fs::File::from_std(spooled);
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| HostError::BadRequest(format!("unreadable pkg part: {}", e)))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(file.into_std().await)
}

fn error_response(err: HostError) -> Response {
    (err.status_code(), err.to_string()).into_response()
}
