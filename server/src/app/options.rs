//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::host::HostOptions;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Root of the next/current/previous application trees
    pub app_path: PathBuf,

    /// Postgres connection string
    pub database_url: String,

    /// JSON key file
    pub keys_file: PathBuf,

    /// Host deploy options
    pub host: HostOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.shutdown_timeout_secs),
            },
            server: ServerOptions {
                listen_addr: settings.listen_addr.clone(),
            },
            app_path: PathBuf::from(&settings.app_path),
            database_url: settings.database_url.clone(),
            keys_file: PathBuf::from(&settings.keys_file),
            host: HostOptions {
                app_schema: settings.app_schema.clone(),
                deploy_timeout: Duration::from_secs(settings.deploy_timeout_secs),
            },
        }
    }
}

/// Lifecycle options for the server
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(15),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind to
    pub listen_addr: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
        }
    }
}
