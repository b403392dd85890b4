//! Color-tagged group of services started and stopped together

use std::collections::HashSet;

use futures::future::join_all;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::errors::HostError;
use crate::srvman::{Color, Service, ServiceConfig};

/// A set of services for one application version, all instantiated under the same color
pub struct Group {
    configs: Vec<ServiceConfig>,
    color: Option<Color>,
    services: Vec<Service>,
}

impl Group {
    /// Create an unstarted group. Service names must be unique.
    pub fn new(configs: Vec<ServiceConfig>) -> Result<Self, HostError> {
        let mut names = HashSet::new();
        for config in &configs {
            if !names.insert(config.name.as_str()) {
                return Err(HostError::ConfigError(format!(
                    "duplicate service name: {}",
                    config.name
                )));
            }
        }

        Ok(Self {
            configs,
            color: None,
            services: Vec::new(),
        })
    }

    /// Start every service under `color`, concurrently.
    ///
    /// All or nothing: if any service fails, every service that did start is stopped before
    /// the first failure is returned.
    pub async fn start(&mut self, color: Color) -> Result<(), HostError> {
        if self.color.is_some() {
            return Err(HostError::Internal("service group already started".to_string()));
        }

        let mut resolved = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            let service = config.resolve(color).map_err(|e| {
                HostError::StartupFailure(format!("bad service config for {}: {}", config.name, e))
            })?;
            resolved.push(service);
        }

        let mut tasks = JoinSet::new();
        for (index, service) in resolved.into_iter().enumerate() {
            tasks.spawn(async move { (index, Service::start(service).await) });
        }

        let mut started = Vec::with_capacity(self.configs.len());
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((index, Ok(service))) => {
                    started.push((index, service));
                    continue;
                }
                Ok((_, Err(e))) => e,
                Err(e) => HostError::from(e),
            };
            if first_error.is_none() {
                first_error = Some(failure);
            }
        }

        if let Some(err) = first_error {
            error!(
                "Service group failed to start under {}, stopping {} started services: {}",
                color,
                started.len(),
                err
            );
            for result in join_all(started.iter().map(|(_, service)| service.stop())).await {
                if let Err(e) = result {
                    error!("Failed to stop service during rollback: {}", e);
                }
            }
            return Err(err);
        }

        started.sort_by_key(|(index, _)| *index);
        self.services = started.into_iter().map(|(_, service)| service).collect();
        self.color = Some(color);

        info!("Service group started under {} ({} services)", color, self.services.len());
        Ok(())
    }

    /// Stop every service concurrently, returning the first error after all have finished
    pub async fn stop(&self) -> Result<(), HostError> {
        let results = join_all(self.services.iter().map(|service| service.stop())).await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!("Failed to stop service: {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                if let Some(color) = self.color {
                    info!("Service group {} stopped", color);
                }
                Ok(())
            }
        }
    }

    pub fn get_service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|service| service.name() == name)
    }

    /// Color the group was started under, `None` before a successful start
    pub fn color(&self) -> Option<Color> {
        self.color
    }

    /// Started services in config order
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn configs(&self) -> &[ServiceConfig] {
        &self.configs
    }
}
