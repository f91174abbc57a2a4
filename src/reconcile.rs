//! Keeps Caddy's routing in step with the store
//!
//! Every routing-affecting mutation runs the same sequence: render and
//! write the Caddyfile, reload (or restart) Caddy, then auto-start the
//! project that was just added. Each step is attempted even when an
//! earlier one failed; failures come back as warnings and the already
//! committed store change is kept.

use crate::caddyfile::{routables, write_config, Renderer};
use crate::db::Database;
use crate::process::{LaunchSpec, ProcessSupervisor};
use crate::proxy::ProxyControl;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A committed store change that affects routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    SiteAdded(i64),
    SiteUpdated(i64),
    SiteDeleted(i64),
    ProjectAdded { id: i64, auto_start: bool },
    ProjectUpdated(i64),
    ProjectDeleted(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    Reloaded,
    Restarted,
    Started,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub config_written: bool,
    pub proxy_action: Option<ProxyAction>,
    /// Pids of projects started by this reconciliation
    pub started: Vec<u32>,
    pub warnings: Vec<String>,
}

pub struct Reconciler {
    db: Arc<Database>,
    renderer: Renderer,
    config_path: PathBuf,
    proxy: Arc<dyn ProxyControl>,
    supervisor: Arc<ProcessSupervisor>,
    /// Serializes reconciliations: one writer of the Caddyfile, one proxy action at a time
    lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        db: Arc<Database>,
        renderer: Renderer,
        config_path: impl Into<PathBuf>,
        proxy: Arc<dyn ProxyControl>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            db,
            renderer,
            config_path: config_path.into(),
            proxy,
            supervisor,
            lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &std::path::Path {
        &self.config_path
    }

    /// Render the Caddyfile for the current store contents
    pub fn render_current(&self) -> Result<String> {
        let sites = self.db.list_sites().context("Failed to load sites")?;
        let projects = self.db.list_projects().context("Failed to load projects")?;
        Ok(self.renderer.render(&routables(&sites, &projects)))
    }

    /// Render and replace the Caddyfile, returning the bytes written
    fn write_now(&self) -> Result<usize> {
        let text = self.render_current()?;
        write_config(&self.config_path, &text)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;
        Ok(text.len())
    }

    /// Write the Caddyfile without touching Caddy
    pub async fn publish(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let bytes = self.write_now()?;
        info!(path = %self.config_path.display(), bytes, "Caddyfile written");
        Ok(())
    }

    fn write_current(&self, report: &mut ReconcileReport) {
        match self.write_now() {
            Ok(bytes) => {
                info!(path = %self.config_path.display(), bytes, "Caddyfile written");
                report.config_written = true;
            }
            Err(e) => {
                warn!(error = %e, "Caddyfile not updated");
                report.warnings.push(format!("{:#}", e));
            }
        }
    }

    /// Reload a running proxy, falling back to a restart
    async fn apply_to_proxy(&self, report: &mut ReconcileReport) {
        if self.proxy.is_running().await {
            match self.proxy.reload().await {
                Ok(()) => {
                    report.proxy_action = Some(ProxyAction::Reloaded);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Reload failed, restarting Caddy");
                    report.warnings.push(e.to_string());
                }
            }
        }

        match self.proxy.restart().await {
            Ok(()) => report.proxy_action = Some(ProxyAction::Restarted),
            Err(e) => {
                warn!(error = %e, "Caddy restart failed");
                report.proxy_action = Some(ProxyAction::Failed);
                report.warnings.push(e.to_string());
            }
        }
    }

    async fn start_project(&self, id: i64, report: &mut ReconcileReport) {
        let project = match self.db.get_project(id) {
            Ok(Some(project)) => project,
            Ok(None) => {
                report.warnings.push(format!("project {} no longer exists", id));
                return;
            }
            Err(e) => {
                report.warnings.push(format!("{:#}", e));
                return;
            }
        };

        match self.supervisor.start(id, &LaunchSpec::from(&project)).await {
            Ok(pid) => {
                info!(project_id = id, pid, name = %project.name, "Project auto-started");
                report.started.push(pid);
            }
            Err(e) => {
                warn!(project_id = id, code = e.code(), error = %e, "Project auto-start failed");
                report
                    .warnings
                    .push(format!("auto-start of '{}' failed: {}", project.name, e));
            }
        }
    }

    /// Bring Caddy and auto-started projects in line with a store change
    pub async fn reconcile(&self, mutation: Mutation) -> ReconcileReport {
        let _guard = self.lock.lock().await;
        debug!(?mutation, "Reconciling");

        let mut report = ReconcileReport::default();
        self.write_current(&mut report);
        self.apply_to_proxy(&mut report).await;

        if let Mutation::ProjectAdded { id, auto_start: true } = mutation {
            self.start_project(id, &mut report).await;
        }

        report
    }

    /// Initial bring-up: write the Caddyfile, start Caddy, start auto-start projects
    pub async fn startup(&self) -> ReconcileReport {
        let _guard = self.lock.lock().await;

        let mut report = ReconcileReport::default();
        self.write_current(&mut report);

        match self.proxy.start().await {
            Ok(()) => report.proxy_action = Some(ProxyAction::Started),
            Err(e) => {
                warn!(error = %e, "Caddy did not start");
                report.proxy_action = Some(ProxyAction::Failed);
                report.warnings.push(e.to_string());
            }
        }

        match self.db.list_projects() {
            Ok(projects) => {
                for project in projects.iter().filter(|p| p.auto_start) {
                    self.start_project(project.id, &mut report).await;
                }
            }
            Err(e) => report.warnings.push(format!("{:#}", e)),
        }

        info!(
            started = report.started.len(),
            warnings = report.warnings.len(),
            "Startup reconciliation finished"
        );
        report
    }
}
