//! Application request handlers
//!
//! The host does not know how an application answers requests. It asks a [`HandlerBuilder`]
//! for a [`RequestHandler`] built from the staged configuration and swaps it in on deploy.

pub mod proxy;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::appconf::AppConfig;
use crate::errors::HostError;
use crate::srvman::Group;

pub use proxy::{ProxyHandler, ProxyHandlerBuilder};

/// Answers application requests for one deployed version
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request<Body>) -> Result<Response, HostError>;
}

/// Everything a builder may use to assemble a handler
pub struct HandlerContext<'a> {
    /// Schema the handler queries once the version is live
    pub schema: &'a str,

    /// Schema the code package was installed into
    pub install_schema: &'a str,

    pub config: &'a AppConfig,

    pub group: &'a Arc<Group>,

    /// Application tree the version is served from
    pub root: &'a Path,
}

/// Builds a request handler from a loaded configuration
#[async_trait]
pub trait HandlerBuilder: Send + Sync {
    async fn build(&self, context: HandlerContext<'_>) -> Result<Arc<dyn RequestHandler>, HostError>;
}

/// Handler in place until the first version is loaded
pub struct NoProjectHandler;

#[async_trait]
impl RequestHandler for NoProjectHandler {
    async fn handle(&self, _request: Request<Body>) -> Result<Response, HostError> {
        Ok((StatusCode::INTERNAL_SERVER_ERROR, "No project loaded").into_response())
    }
}
