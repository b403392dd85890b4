//! A single supervised worker process

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::errors::HostError;
use crate::srvman::config::ResolvedService;
use crate::srvman::Color;

/// Delay between health check connection attempts
const HEALTH_CHECK_BACKOFF: Duration = Duration::from_millis(50);

/// Whichever finished first while starting
enum Startup {
    Exited(std::io::Result<ExitStatus>),
    Checked(Result<(), HostError>),
}

/// Handles to the monitor task of a running process
struct MonitorHandle {
    stop_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

/// A running instantiation of a service config for one color. Owned by a Group.
pub struct Service {
    name: String,
    color: Color,
    http_address: String,
    pid: Option<u32>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl Service {
    /// Spawn the process and wait until it is ready.
    ///
    /// The process exiting before its health check passes is a failure, whatever the exit code.
    /// A process that fails its health check is killed before this returns.
    pub async fn start(resolved: ResolvedService) -> Result<Service, HostError> {
        let ResolvedService {
            name,
            color,
            cmd,
            args,
            http_address,
            health_check,
            max_startup_duration,
        } = resolved;

        let mut child = Command::new(&cmd)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HostError::StartupFailure(format!("{}: failed to spawn {}: {}", name, cmd, e))
            })?;

        let pid = child.id();
        info!("Started process for service {} ({}, pid {:?})", name, color, pid);

        let startup = tokio::select! {
            status = child.wait() => Startup::Exited(status),
            ready = wait_for_startup(health_check.as_deref(), max_startup_duration) => Startup::Checked(ready),
        };

        match startup {
            Startup::Exited(status) => {
                let reason = match status {
                    Ok(status) => format!("process immediately exited with {}", status),
                    Err(e) => format!("failed to wait for process: {}", e),
                };
                error!("Service {} failed to start: {}", name, reason);
                return Err(HostError::StartupFailure(format!("{}: {}", name, reason)));
            }
            Startup::Checked(Err(e)) => {
                error!("Startup health check failed for service {}: {}", name, e);
                if let Err(kill_err) = child.kill().await {
                    error!("Failed to kill service {}: {}", name, kill_err);
                }
                return Err(HostError::StartupFailure(format!("{}: {}", name, e)));
            }
            Startup::Checked(Ok(())) => {}
        }

        info!("Service {} ready", name);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(monitor(name.clone(), child, stop_rx, done_tx));

        Ok(Service {
            name,
            color,
            http_address,
            pid,
            monitor: Mutex::new(Some(MonitorHandle { stop_tx, done_rx })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color(&self) -> Color {
        self.color
    }

    /// Resolved HTTP address advertised by the service
    pub fn http_address(&self) -> &str {
        &self.http_address
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process and wait until it has been reaped. Later calls return immediately.
    pub async fn stop(&self) -> Result<(), HostError> {
        let mut monitor = self.monitor.lock().await;
        let Some(handle) = monitor.take() else {
            return Ok(());
        };

        // The monitor may already be waiting on its own after an unexpected exit.
        let _ = handle.stop_tx.send(());
        handle.done_rx.await.map_err(|_| {
            HostError::Internal(format!("monitor for service {} ended without reporting", self.name))
        })?;

        debug!("Service {} stopped", self.name);
        Ok(())
    }

    pub async fn is_stopped(&self) -> bool {
        self.monitor.lock().await.is_none()
    }
}

/// Watch a running process until it exits on its own or a stop is requested.
///
/// Dropping the stop sender counts as a stop request.
async fn monitor(
    name: String,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut stop_rx => None,
    };

    match exited {
        Some(status) => {
            match status {
                Ok(status) => warn!("Service {} exited unexpectedly: {}", name, status),
                Err(e) => error!("Failed to wait for service {}: {}", name, e),
            }
            let _ = stop_rx.await;
        }
        None => {
            info!("Sending kill signal to service {}", name);
            if let Err(e) = child.kill().await {
                error!("Failed to kill service {}: {}", name, e);
            }
            info!("Service {} terminated", name);
        }
    }

    let _ = done_tx.send(());
}

/// Resolve once the service is ready: immediately without a health check, otherwise when
/// the target accepts a TCP connection.
async fn wait_for_startup(target: Option<&str>, deadline: Duration) -> Result<(), HostError> {
    let Some(target) = target else {
        return Ok(());
    };

    tokio::time::timeout(deadline, poll_tcp_connect(target))
        .await
        .map_err(|_| {
            HostError::StartupFailure(format!(
                "health check on {} did not pass within {:?}",
                target, deadline
            ))
        })
}

async fn poll_tcp_connect(target: &str) {
    loop {
        match TcpStream::connect(target).await {
            Ok(_) => return,
            Err(e) => {
                debug!("Health check connect to {} failed: {}", target, e);
                tokio::time::sleep(HEALTH_CHECK_BACKOFF).await;
            }
        }
    }
}
