//! Service configuration and color variable interpolation

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::HostError;
use crate::srvman::Color;

/// Default time a service gets to pass its first health check
pub const DEFAULT_MAX_STARTUP_DURATION: Duration = Duration::from_secs(60);

static BLUEGREEN_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[bluegreen\.([a-zA-Z0-9_-]+)\]\]").expect("placeholder pattern is valid")
});

/// Startup health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Address that must accept a TCP connection
    pub tcp_connect: String,
}

/// An auxiliary worker process, before it is bound to a color
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,

    pub cmd: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub http_address: String,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub max_startup_duration_secs: Option<u64>,

    #[serde(default)]
    pub blue: Option<HashMap<String, Value>>,

    #[serde(default)]
    pub green: Option<HashMap<String, Value>>,
}

/// A service config with every placeholder resolved for one color
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub color: Color,
    pub cmd: String,
    pub args: Vec<String>,
    pub http_address: String,
    pub health_check: Option<String>,
    pub max_startup_duration: Duration,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            http_address: String::new(),
            health_check: None,
            max_startup_duration_secs: None,
            blue: None,
            green: None,
        }
    }

    pub fn max_startup_duration(&self) -> Duration {
        match self.max_startup_duration_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_MAX_STARTUP_DURATION,
        }
    }

    /// Variable map for a color
    pub fn vars_for(&self, color: Color) -> Option<&HashMap<String, Value>> {
        match color {
            Color::Blue => self.blue.as_ref(),
            Color::Green => self.green.as_ref(),
        }
    }

    /// Interpolate the command, arguments, HTTP address and health check target for `color`
    pub fn resolve(&self, color: Color) -> Result<ResolvedService, HostError> {
        let vars = self.vars_for(color);

        let args = self
            .args
            .iter()
            .map(|arg| interpolate(arg, vars))
            .collect::<Result<Vec<_>, _>>()?;

        let health_check = match &self.health_check {
            Some(check) => Some(interpolate(&check.tcp_connect, vars)?),
            None => None,
        };

        Ok(ResolvedService {
            name: self.name.clone(),
            color,
            cmd: interpolate(&self.cmd, vars)?,
            args,
            http_address: interpolate(&self.http_address, vars)?,
            health_check,
            max_startup_duration: self.max_startup_duration(),
        })
    }
}

/// Replace every `[[bluegreen.KEY]]` in `template` with the string form of `KEY` from `vars`
pub fn interpolate(
    template: &str,
    vars: Option<&HashMap<String, Value>>,
) -> Result<String, HostError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in BLUEGREEN_PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = vars
            .and_then(|vars| vars.get(key.as_str()))
            .ok_or_else(|| HostError::ConfigError(format!("missing key: {}", key.as_str())))?;

        out.push_str(&template[last..whole.start()]);
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}
