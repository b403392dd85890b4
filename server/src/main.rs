//! swaphost - Entry Point
//!
//! Serves an application with zero-downtime deploys, or acts as the deploy client.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use swaphost::app::options::AppOptions;
use swaphost::app::run::run;
use swaphost::deploy::client::DeployClient;
use swaphost::deploy::keygen::create_deploy_key;
use swaphost::filesys::file::File;
use swaphost::logs::{init_logging, LogOptions};
use swaphost::storage::settings::Settings;
use swaphost::utils::version_info;

use serde_json::json;
use tracing::{error, info};

const DEFAULT_SETTINGS_FILE: &str = "./swaphost.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        println!("{}", json!(version_info()));
        return ExitCode::SUCCESS;
    }

    // Generate a deploy key pair and exit
    if cli_args.contains_key("create-deploy-key") {
        let pair = create_deploy_key();
        println!("deploy key (keep secret): {}", pair.seed_hex);
        println!("public key (add to the key file): {}", pair.public_hex);
        return ExitCode::SUCCESS;
    }

    if cli_args.contains_key("deploy") {
        return deploy(&cli_args).await;
    }

    serve(&cli_args).await
}

async fn deploy(cli_args: &HashMap<String, String>) -> ExitCode {
    if let Err(e) = init_logging(LogOptions::default()) {
        println!("Failed to initialize logging: {e}");
    }

    let (Some(url), Some(api_key), Some(deploy_key)) = (
        cli_args.get("url"),
        cli_args.get("api-key"),
        cli_args.get("deploy-key"),
    ) else {
        error!("Usage: swaphost --deploy --url=<server> --api-key=<key> --deploy-key=<hex seed> [--path=<project>]");
        return ExitCode::FAILURE;
    };
    let path = cli_args.get("path").map(String::as_str).unwrap_or(".");

    let client = match DeployClient::new(url, api_key, deploy_key) {
        Ok(client) => client,
        Err(e) => {
            error!("Invalid deploy arguments: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match client.deploy(path).await {
        Ok(body) => {
            info!("Deploy succeeded: {}", body);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Deploy failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(cli_args: &HashMap<String, String>) -> ExitCode {
    // Retrieve the settings file
    let settings_file = File::new(
        cli_args
            .get("settings")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SETTINGS_FILE),
    );
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                println!("Unable to read settings file {}: {e}", settings_file.path().display());
                return ExitCode::FAILURE;
            }
        }
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.as_ref().map(Into::into),
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    if !settings_file.exists().await {
        info!(
            "No settings file at {}, using defaults",
            settings_file.path().display()
        );
    }

    // Run the server
    let options = AppOptions::from(&settings);
    info!("Running swaphost with options: {:?}", options);
    match run(options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run swaphost: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
