//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,

    /// Optional directory for a daily rolling log file
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Root of the next/current/previous application trees
    #[serde(default = "default_app_path")]
    pub app_path: String,

    /// Postgres connection string
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Live schema name; deploys install into `<app_schema>_next` first
    #[serde(default = "default_app_schema")]
    pub app_schema: String,

    /// JSON file with users, API keys and deploy keys
    #[serde(default = "default_keys_file")]
    pub keys_file: String,

    /// Bound on graceful shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Bound on staging and installing one deploy
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_app_path() -> String {
    "./app".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost/swaphost".to_string()
}

fn default_app_schema() -> String {
    "app".to_string()
}

fn default_keys_file() -> String {
    "./keys.json".to_string()
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_deploy_timeout() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_dir: None,
            listen_addr: default_listen_addr(),
            app_path: default_app_path(),
            database_url: default_database_url(),
            app_schema: default_app_schema(),
            keys_file: default_keys_file(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            deploy_timeout_secs: default_deploy_timeout(),
        }
    }
}
