//! Application configuration loaded from `config/*.yml`

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::HostError;
use crate::srvman::ServiceConfig;

/// Merged application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppConfig {
    /// Consumed by the application layer, kept as-is
    #[serde(default)]
    pub csrf_protection: Option<serde_yaml::Value>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub deploy: Option<DeployConfig>,
}

/// Deploy-time hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeployConfig {
    /// Command run with the staged tree as working directory before install
    #[serde(default)]
    pub exec_remote: Option<ExecRemote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecRemote {
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// HTTP method a route is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    /// Any method
    Any,
}

impl RouteMethod {
    pub fn matches(&self, method: &http::Method) -> bool {
        match self {
            RouteMethod::Get => method == http::Method::GET || method == http::Method::HEAD,
            RouteMethod::Post => method == http::Method::POST,
            RouteMethod::Put => method == http::Method::PUT,
            RouteMethod::Patch => method == http::Method::PATCH,
            RouteMethod::Delete => method == http::Method::DELETE,
            RouteMethod::Any => true,
        }
    }
}

/// What a route dispatches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget<'a> {
    /// Stored procedure name
    Func(&'a str),
    /// Service name or literal address
    ReverseProxy(&'a str),
}

/// One entry of the route table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_proxy: Option<String>,

    /// Parameter and password options for the application layer
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Route {
    /// The single method and pattern this route declares
    pub fn method_and_pattern(&self) -> Result<(RouteMethod, &str), HostError> {
        let declared: Vec<(RouteMethod, &str)> = [
            (RouteMethod::Get, &self.get),
            (RouteMethod::Post, &self.post),
            (RouteMethod::Put, &self.put),
            (RouteMethod::Patch, &self.patch),
            (RouteMethod::Delete, &self.delete),
            (RouteMethod::Any, &self.path),
        ]
        .into_iter()
        .filter_map(|(method, pattern)| pattern.as_deref().map(|p| (method, p)))
        .collect();

        match declared.as_slice() {
            [single] => Ok(*single),
            [] => Err(HostError::ConfigError("route has no path".to_string())),
            _ => Err(HostError::ConfigError(format!(
                "route declares {} paths, expected one",
                declared.len()
            ))),
        }
    }

    pub fn target(&self) -> Result<RouteTarget<'_>, HostError> {
        match (&self.func, &self.reverse_proxy) {
            (Some(func), None) => Ok(RouteTarget::Func(func)),
            (None, Some(proxy)) => Ok(RouteTarget::ReverseProxy(proxy)),
            (Some(_), Some(_)) => Err(HostError::ConfigError(
                "route sets both func and reverse-proxy".to_string(),
            )),
            (None, None) => Err(HostError::ConfigError(
                "route needs func or reverse-proxy".to_string(),
            )),
        }
    }
}

impl AppConfig {
    /// Parse one YAML document. Unknown top-level keys are rejected.
    pub fn from_yaml(yaml: &str) -> Result<Self, HostError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Fold `other` into `self`: lists are appended, single values are replaced
    pub fn merge(&mut self, other: AppConfig) {
        if other.csrf_protection.is_some() {
            self.csrf_protection = other.csrf_protection;
        }
        if other.deploy.is_some() {
            self.deploy = other.deploy;
        }
        self.routes.extend(other.routes);
        self.services.extend(other.services);
    }

    pub fn exec_remote(&self) -> Option<&ExecRemote> {
        self.deploy.as_ref().and_then(|d| d.exec_remote.as_ref())
    }
}

/// Load and merge every `.yml`/`.yaml` file under `dir`, in file name order
pub fn load(dir: &Path) -> Result<AppConfig, HostError> {
    let mut config = AppConfig::default();
    let mut files_found = 0;

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            HostError::ConfigError(format!("failed to walk {}: {}", dir.display(), e))
        })?;
        let is_yaml = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }

        files_found += 1;
        let yaml = fs::read_to_string(entry.path())?;
        let parsed = AppConfig::from_yaml(&yaml).map_err(|e| {
            HostError::ConfigError(format!("{}: {}", entry.path().display(), e))
        })?;
        debug!("Loaded app config {}", entry.path().display());
        config.merge(parsed);
    }

    if files_found == 0 {
        return Err(HostError::ConfigError(format!(
            "no yml files found in {}",
            dir.display()
        )));
    }

    Ok(config)
}
