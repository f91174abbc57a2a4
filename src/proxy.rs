//! Caddy process control
//!
//! A single Caddy instance runs at a time. It is launched against the
//! managed Caddyfile, and its stdout/stderr are appended to one log file.

use crate::logs;
use futures::future::BoxFuture;
use serde::Serialize;
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Log lines inspected for certificate problems
const SSL_SCAN_LINES: usize = 200;

/// Certificate failure signatures: every keyword must appear in one line
const SSL_SIGNATURES: &[(&[&str], &str)] = &[
    (&["acme", "error"], "ACME certificate issuance failed"),
    (&["dns", "error"], "DNS validation failed; check the domain's DNS records"),
    (&["timeout"], "Connection timed out; check network and firewall settings"),
    (&["rate limit"], "Certificate issuance is rate limited; try again later"),
    (&["unauthorized"], "Domain validation was refused; make sure the domain points to this server"),
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Caddy is not installed at {0}")]
    NotInstalled(PathBuf),
    #[error("Caddy is not running")]
    NotRunning,
    #[error("failed to launch Caddy: {0}")]
    Launch(std::io::Error),
    #[error("Caddy reload failed: {0}")]
    ReloadFailed(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProxyStatus {
    pub running: bool,
    pub installed: bool,
    pub binary: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SslStatus {
    pub errors: Vec<String>,
    pub has_errors: bool,
}

/// Lifecycle operations on the reverse proxy
pub trait ProxyControl: Send + Sync {
    /// Stop any running instance, then launch a new one
    fn start(&self) -> BoxFuture<'_, Result<(), ProxyError>>;

    /// Kill the proxy; never fails
    fn stop(&self) -> BoxFuture<'_, ()>;

    fn restart(&self) -> BoxFuture<'_, Result<(), ProxyError>>;

    /// Apply the current configuration without dropping connections
    fn reload(&self) -> BoxFuture<'_, Result<(), ProxyError>>;

    fn is_running(&self) -> BoxFuture<'_, bool>;

    fn status(&self) -> BoxFuture<'_, ProxyStatus>;

    /// Last `lines` lines of the proxy log
    fn logs(&self, lines: usize) -> std::io::Result<Vec<String>>;

    /// Certificate problems found in the recent proxy log
    fn ssl_status(&self) -> SslStatus {
        let lines = self.logs(SSL_SCAN_LINES).unwrap_or_default();
        let errors: Vec<String> = scan_ssl_errors(&lines).into_iter().map(str::to_string).collect();
        SslStatus {
            has_errors: !errors.is_empty(),
            errors,
        }
    }
}

/// Match log lines against the known certificate failure signatures
pub fn scan_ssl_errors(lines: &[String]) -> Vec<&'static str> {
    let lowered: Vec<String> = lines.iter().map(|l| l.to_lowercase()).collect();

    SSL_SIGNATURES
        .iter()
        .filter(|(keywords, _)| {
            lowered
                .iter()
                .any(|line| keywords.iter().all(|k| line.contains(k)))
        })
        .map(|(_, message)| *message)
        .collect()
}

/// Whether any OS process has exactly this name
fn process_running(name: &OsStr) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let found = sys.processes_by_exact_name(name).next().is_some();
    found
}

/// Kill every OS process with exactly this name except ourselves,
/// returning how many were signalled
fn kill_processes_named(name: &OsStr) -> usize {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = std::process::id();
    let mut killed = 0;
    for process in sys.processes_by_exact_name(name) {
        if process.pid().as_u32() == own_pid {
            continue;
        }
        if process.kill() {
            killed += 1;
        }
    }
    killed
}

/// Controls a Caddy binary through its CLI
pub struct CaddyController {
    binary: PathBuf,
    config_path: PathBuf,
    log_path: PathBuf,
    settle_delay: Duration,
    /// The instance launched by this controller
    child: Mutex<Option<Child>>,
}

impl CaddyController {
    pub fn new(
        binary: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            log_path: log_path.into(),
            settle_delay,
            child: Mutex::new(None),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn is_installed(&self) -> bool {
        self.binary.is_file()
    }

    fn binary_name(&self) -> Option<&OsStr> {
        self.binary.file_name()
    }

    /// Kill the tracked child and any stray instance; the slot lock must be held
    async fn stop_locked(&self, slot: &mut Option<Child>) {
        if let Some(name) = self.binary_name().map(OsStr::to_os_string) {
            let stray = tokio::task::spawn_blocking(move || kill_processes_named(&name))
                .await
                .unwrap_or(0);
            if stray > 0 {
                debug!(count = stray, "Killed Caddy processes by name");
            }
        }

        if let Some(mut child) = slot.take() {
            let pid = child.id();
            if let Err(e) = child.kill().await {
                debug!(?pid, error = %e, "Caddy child already gone");
            }
            info!(?pid, "Caddy stopped");
        }
    }

    async fn start_inner(&self) -> Result<(), ProxyError> {
        let mut slot = self.child.lock().await;
        self.stop_locked(&mut slot).await;

        if !self.is_installed() {
            return Err(ProxyError::NotInstalled(self.binary.clone()));
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(ProxyError::Launch)?;
        let log_err = log.try_clone().map_err(ProxyError::Launch)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("run")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--adapter")
            .arg("caddyfile")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(dir) = self.binary.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(ProxyError::Launch)?;
        info!(pid = ?child.id(), config = %self.config_path.display(), "Caddy started");
        *slot = Some(child);
        Ok(())
    }

    async fn is_running_inner(&self) -> bool {
        {
            let mut slot = self.child.lock().await;
            if let Some(child) = slot.as_mut() {
                match child.try_wait() {
                    Ok(None) => return true,
                    Ok(Some(status)) => {
                        warn!(%status, "Caddy exited");
                        *slot = None;
                    }
                    Err(e) => debug!(error = %e, "Could not poll Caddy child"),
                }
            }
        }

        let Some(name) = self.binary_name().map(OsStr::to_os_string) else {
            return false;
        };
        tokio::task::spawn_blocking(move || process_running(&name))
            .await
            .unwrap_or(false)
    }

    async fn reload_inner(&self) -> Result<(), ProxyError> {
        if !self.is_running_inner().await {
            return Err(ProxyError::NotRunning);
        }

        let output = Command::new(&self.binary)
            .arg("reload")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--adapter")
            .arg("caddyfile")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProxyError::ReloadFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(ProxyError::ReloadFailed(message));
        }

        info!("Caddy configuration reloaded");
        Ok(())
    }

    /// First line of `caddy version`
    async fn version(&self) -> Option<String> {
        if !self.is_installed() {
            return None;
        }
        let output = Command::new(&self.binary)
            .arg("version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
    }
}

impl ProxyControl for CaddyController {
    fn start(&self) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(self.start_inner())
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut slot = self.child.lock().await;
            self.stop_locked(&mut slot).await;
        })
    }

    fn restart(&self) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(async move {
            info!("Restarting Caddy");
            self.stop().await;
            tokio::time::sleep(self.settle_delay).await;
            self.start_inner().await
        })
    }

    fn reload(&self) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(self.reload_inner())
    }

    fn is_running(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.is_running_inner())
    }

    fn status(&self) -> BoxFuture<'_, ProxyStatus> {
        Box::pin(async move {
            ProxyStatus {
                running: self.is_running_inner().await,
                installed: self.is_installed(),
                binary: self.binary.display().to_string(),
                version: self.version().await,
            }
        })
    }

    fn logs(&self, lines: usize) -> std::io::Result<Vec<String>> {
        logs::tail_lines(&self.log_path, lines)
    }
}
