//! Reverse proxy handler routing requests to group services

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::appconf::{RouteMethod, RouteTarget};
use crate::errors::HostError;
use crate::handler::{HandlerBuilder, HandlerContext, RequestHandler};
use crate::srvman::Group;

/// Headers that apply to a single connection and are not forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

/// A URL pattern: `/widgets/:id` matches one segment per placeholder, a trailing `/` or `*`
/// matches everything below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
    prefix: bool,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, HostError> {
        if !pattern.starts_with('/') {
            return Err(HostError::ConfigError(format!(
                "route pattern must start with '/': {}",
                pattern
            )));
        }

        let mut prefix = pattern.ends_with('/');
        let mut segments = Vec::new();
        for part in pattern.split('/').filter(|p| !p.is_empty()) {
            if part == "*" {
                prefix = true;
                break;
            }
            if part.starts_with(':') || (part.starts_with('{') && part.ends_with('}')) {
                segments.push(Segment::Param);
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self { segments, prefix })
    }

    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let length_ok = if self.prefix {
            parts.len() >= self.segments.len()
        } else {
            parts.len() == self.segments.len()
        };

        length_ok
            && self.segments.iter().zip(&parts).all(|(segment, part)| match segment {
                Segment::Literal(literal) => literal == part,
                Segment::Param => true,
            })
    }
}

#[derive(Debug, Clone)]
struct ProxyRoute {
    method: RouteMethod,
    pattern: RoutePattern,
    upstream: String,
}

/// Forwards matching requests to an upstream HTTP address
pub struct ProxyHandler {
    routes: Vec<ProxyRoute>,
    client: reqwest::Client,
}

impl ProxyHandler {
    fn route_for(&self, request: &Request<Body>) -> Option<&ProxyRoute> {
        self.routes.iter().find(|route| {
            route.method.matches(request.method()) && route.pattern.matches(request.uri().path())
        })
    }

    /// Upstream base URLs in route order
    pub fn upstreams(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.upstream.as_str()).collect()
    }

    async fn forward(&self, upstream: &str, request: Request<Body>) -> Result<Response, HostError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", upstream, path_and_query);
        debug!("Proxying {} {}", parts.method, url);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let result = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream_response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Upstream {} failed: {}", url, e);
                return Ok((StatusCode::BAD_GATEWAY, "Bad gateway").into_response());
            }
        };

        let status = upstream_response.status();
        let mut headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl RequestHandler for ProxyHandler {
    async fn handle(&self, request: Request<Body>) -> Result<Response, HostError> {
        let Some(route) = self.route_for(&request) else {
            return Ok((StatusCode::NOT_FOUND, "Not found").into_response());
        };
        let upstream = route.upstream.clone();
        self.forward(&upstream, request).await
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Resolve a `reverse-proxy` target: a service name in the group, otherwise a literal address
fn resolve_upstream(target: &str, group: &Group) -> Result<String, HostError> {
    let address = match group.get_service(target) {
        Some(service) => service.http_address().to_string(),
        None => target.to_string(),
    };

    if address.is_empty() {
        return Err(HostError::ConfigError(format!(
            "reverse-proxy target {} has no HTTP address",
            target
        )));
    }

    let address = if address.contains("://") {
        address
    } else {
        format!("http://{}", address)
    };
    url::Url::parse(&address).map_err(|e| {
        HostError::ConfigError(format!("invalid reverse-proxy address {}: {}", address, e))
    })?;

    Ok(address.trim_end_matches('/').to_string())
}

/// Builds a [`ProxyHandler`] from the `reverse-proxy` routes of a config.
///
/// Stored procedure routes need an application layer and are rejected.
#[derive(Debug, Clone, Default)]
pub struct ProxyHandlerBuilder {
    client: reqwest::Client,
}

impl ProxyHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandlerBuilder for ProxyHandlerBuilder {
    async fn build(&self, context: HandlerContext<'_>) -> Result<Arc<dyn RequestHandler>, HostError> {
        let mut routes = Vec::with_capacity(context.config.routes.len());

        for route in &context.config.routes {
            let (method, pattern) = route.method_and_pattern()?;
            let upstream = match route.target()? {
                RouteTarget::ReverseProxy(target) => resolve_upstream(target, context.group)?,
                RouteTarget::Func(func) => {
                    return Err(HostError::ConfigError(format!(
                        "route {} calls function {}, which needs an application handler",
                        pattern, func
                    )));
                }
            };
            routes.push(ProxyRoute {
                method,
                pattern: RoutePattern::parse(pattern)?,
                upstream,
            });
        }

        info!(
            "Built proxy handler with {} routes for {}",
            routes.len(),
            context.root.display()
        );
        Ok(Arc::new(ProxyHandler {
            routes,
            client: self.client.clone(),
        }))
    }
}
