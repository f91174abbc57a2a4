//! Operations behind the HTTP API
//!
//! Handlers stay thin: they parse the request, call one `Panel` method and
//! serialize the result. Everything that touches more than one component
//! (store, supervisor, Caddy, reconciliation) lives here.

use crate::caddyfile::is_valid_domain;
use crate::db::{Database, ProjectInput, ProjectRecord, SiteInput, SiteRecord, TaskInput, TaskRecord};
use crate::diagnostics::{self, DiagnosticReport, FixAction, FixError, Issue};
use crate::error::{ApiErrorCode, StartError, StopError};
use crate::process::{LaunchSpec, ProcessSupervisor, ProjectStatus};
use crate::proxy::{ProxyControl, ProxyError, ProxyStatus, SslStatus};
use crate::reconcile::{Mutation, ReconcileReport, Reconciler};
use crate::tasks::{self, TaskOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_LOG_LINES: usize = 100;

/// Settings the API may change
pub const SETTING_SECURITY_PATH: &str = "security_path";
pub const SETTING_WWW_ROOT: &str = "www_root";
const EDITABLE_SETTINGS: &[&str] = &[SETTING_SECURITY_PATH, SETTING_WWW_ROOT];

const NO_LOGS_PLACEHOLDER: &str = "No logs yet";

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("{0}")]
    Invalid(String),

    #[error("{error}")]
    Start { error: StartError, log_path: String },

    #[error(transparent)]
    Stop(#[from] StopError),

    /// Caddy lifecycle failure with remediation hints
    #[error("{error}")]
    Proxy {
        error: ProxyError,
        suggestions: Vec<String>,
    },

    #[error(transparent)]
    Fix(#[from] FixError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PanelError {
    fn not_found(kind: &'static str, id: i64) -> Self {
        PanelError::NotFound { kind, id }
    }

    pub fn api_code(&self) -> ApiErrorCode {
        match self {
            PanelError::NotFound { .. } => ApiErrorCode::NotFound,
            PanelError::Invalid(_) => ApiErrorCode::BadRequest,
            PanelError::Start { .. } | PanelError::Stop(_) => ApiErrorCode::ProcessError,
            PanelError::Proxy {
                error: ProxyError::NotInstalled(_),
                ..
            } => ApiErrorCode::ProxyNotInstalled,
            PanelError::Proxy {
                error: ProxyError::NotRunning,
                ..
            } => ApiErrorCode::ProxyNotRunning,
            PanelError::Proxy { .. } => ApiErrorCode::ProxyError,
            PanelError::Fix(FixError::Unsupported(_)) => ApiErrorCode::Unsupported,
            PanelError::Fix(FixError::NoListener(_)) => ApiErrorCode::BadRequest,
            PanelError::Fix(_) => ApiErrorCode::InternalError,
            PanelError::Store(_) => ApiErrorCode::InternalError,
        }
    }
}

pub type PanelResult<T> = std::result::Result<T, PanelError>;

/// Attach remediation hints to a Caddy lifecycle failure. Launch and
/// reload failures are annotated with the live port and privilege checks.
async fn diagnose_proxy_error(error: ProxyError) -> PanelError {
    let suggestions = match error {
        ProxyError::NotInstalled(_) => vec![
            "Install Caddy by enabling caddy.auto_install and restarting caddy-manager".to_string(),
            "Or set caddy.binary to an existing Caddy executable".to_string(),
        ],
        ProxyError::NotRunning => vec!["Start Caddy first".to_string()],
        ProxyError::Launch(_) | ProxyError::ReloadFailed(_) => {
            tokio::task::spawn_blocking(diagnostics::diagnose_proxy_failure)
                .await
                .unwrap_or_default()
        }
    };
    warn!(error = %error, "Caddy operation failed");
    PanelError::Proxy { error, suggestions }
}

/// A stored record together with the reconciliation it triggered
#[derive(Debug, Serialize)]
pub struct Mutated<T: Serialize> {
    pub record: T,
    pub reconcile: ReconcileReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStarted {
    pub id: i64,
    pub pid: u32,
    pub log_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectState {
    pub id: i64,
    pub status: ProjectStatus,
    pub pid: Option<u32>,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub task: TaskRecord,
    pub outcome: TaskOutcome,
}

pub struct Panel {
    db: Arc<Database>,
    supervisor: Arc<ProcessSupervisor>,
    proxy: Arc<dyn ProxyControl>,
    reconciler: Arc<Reconciler>,
    default_www_root: PathBuf,
}

impl Panel {
    pub fn new(
        db: Arc<Database>,
        supervisor: Arc<ProcessSupervisor>,
        proxy: Arc<dyn ProxyControl>,
        reconciler: Arc<Reconciler>,
        default_www_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            supervisor,
            proxy,
            reconciler,
            default_www_root: default_www_root.into(),
        }
    }

    /// Seed default settings and create the web root
    pub fn init_defaults(&self) -> PanelResult<()> {
        let default_root = self.default_www_root.to_string_lossy().to_string();
        self.db.init_setting(SETTING_WWW_ROOT, &default_root)?;

        let root = self
            .db
            .get_setting(SETTING_WWW_ROOT)?
            .unwrap_or(default_root);
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!(path = %root, error = %e, "Could not create web root");
        }
        Ok(())
    }

    /// True until the first user account exists
    pub fn is_first_run(&self) -> PanelResult<bool> {
        Ok(self.db.user_count()? == 0)
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    // ==================== Projects ====================

    /// All projects, with status refreshed from the supervisor
    pub async fn list_projects(&self) -> PanelResult<Vec<ProjectRecord>> {
        let mut projects = self.db.list_projects()?;
        for project in projects.iter_mut() {
            self.sync_status(project).await;
        }
        Ok(projects)
    }

    pub async fn get_project(&self, id: i64) -> PanelResult<ProjectRecord> {
        let mut project = self.load_project(id)?;
        self.sync_status(&mut project).await;
        Ok(project)
    }

    fn load_project(&self, id: i64) -> PanelResult<ProjectRecord> {
        self.db
            .get_project(id)?
            .ok_or_else(|| PanelError::not_found("project", id))
    }

    /// Persist the observed status when it differs from the cached one
    async fn sync_status(&self, project: &mut ProjectRecord) {
        let observed = self.supervisor.status(project.id, project.port).await;
        if observed != project.status {
            if let Err(e) = self.db.update_project_status(project.id, observed) {
                warn!(project_id = project.id, error = %e, "Failed to persist observed status");
            }
            project.status = observed;
        }
    }

    pub async fn add_project(&self, input: ProjectInput) -> PanelResult<Mutated<ProjectRecord>> {
        let domain_warnings = validate_project_input(&input)?;

        let id = self.db.create_project(&input)?;
        info!(project_id = id, name = %input.name, port = input.port, "Project created");

        let mut reconcile = self
            .reconciler
            .reconcile(Mutation::ProjectAdded {
                id,
                auto_start: input.auto_start,
            })
            .await;
        reconcile.warnings.extend(domain_warnings);

        Ok(Mutated {
            record: self.load_project(id)?,
            reconcile,
        })
    }

    pub async fn update_project(&self, id: i64, input: ProjectInput) -> PanelResult<Mutated<ProjectRecord>> {
        let domain_warnings = validate_project_input(&input)?;

        if !self.db.update_project(id, &input)? {
            return Err(PanelError::not_found("project", id));
        }
        info!(project_id = id, "Project updated");

        let mut reconcile = self.reconciler.reconcile(Mutation::ProjectUpdated(id)).await;
        reconcile.warnings.extend(domain_warnings);

        Ok(Mutated {
            record: self.load_project(id)?,
            reconcile,
        })
    }

    /// Stop the project's process, delete its row, then reconcile
    pub async fn delete_project(&self, id: i64) -> PanelResult<ReconcileReport> {
        self.load_project(id)?;

        let stop_warning = self.supervisor.stop(id).await.err().map(|e| e.to_string());
        if !self.db.delete_project(id)? {
            return Err(PanelError::not_found("project", id));
        }
        info!(project_id = id, "Project deleted");

        let mut report = self.reconciler.reconcile(Mutation::ProjectDeleted(id)).await;
        report.warnings.extend(stop_warning);
        Ok(report)
    }

    /// Preflight the launch configuration, then start the process
    pub async fn start_project(&self, id: i64) -> PanelResult<ProjectStarted> {
        let project = self.load_project(id)?;
        let spec = LaunchSpec::from(&project);
        let log_path = self.supervisor.log_path(id).to_string_lossy().to_string();
        let start_error = |error: StartError| PanelError::Start {
            error,
            log_path: log_path.clone(),
        };

        let problems = spec.validate();
        if !problems.is_empty() {
            return Err(start_error(StartError::InvalidConfig(problems)));
        }

        if !self.supervisor.is_tracked(id).await {
            let port = project.port;
            let check = tokio::task::spawn_blocking(move || diagnostics::check_port(port))
                .await
                .map_err(|e| PanelError::Store(e.into()))?;
            if check.in_use {
                return Err(start_error(StartError::PortInUse {
                    port,
                    owner: check.owner,
                }));
            }
        }

        let pid = self.supervisor.start(id, &spec).await.map_err(start_error)?;
        Ok(ProjectStarted {
            id,
            pid,
            log_path: log_path.clone(),
        })
    }

    pub async fn stop_project(&self, id: i64) -> PanelResult<()> {
        self.load_project(id)?;
        self.supervisor.stop(id).await?;
        Ok(())
    }

    pub async fn restart_project(&self, id: i64) -> PanelResult<ProjectStarted> {
        self.stop_project(id).await?;
        self.start_project(id).await
    }

    pub async fn project_status(&self, id: i64) -> PanelResult<ProjectState> {
        let project = self.get_project(id).await?;
        Ok(ProjectState {
            id,
            status: project.status,
            pid: self.supervisor.pid(id).await,
            port: project.port,
        })
    }

    pub fn project_logs(&self, id: i64, lines: usize) -> PanelResult<Vec<String>> {
        self.load_project(id)?;
        match self.supervisor.logs(id, lines) {
            Ok(lines) => Ok(lines),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![NO_LOGS_PLACEHOLDER.to_string()]),
            Err(e) => Err(PanelError::Store(e.into())),
        }
    }

    // ==================== Sites ====================

    pub fn list_sites(&self) -> PanelResult<Vec<SiteRecord>> {
        Ok(self.db.list_sites()?)
    }

    pub fn get_site(&self, id: i64) -> PanelResult<SiteRecord> {
        self.db
            .get_site(id)?
            .ok_or_else(|| PanelError::not_found("site", id))
    }

    pub async fn add_site(&self, input: SiteInput) -> PanelResult<Mutated<SiteRecord>> {
        validate_site_input(&input)?;
        let id = self.db.create_site(&input)?;
        info!(site_id = id, domain = %input.domain, "Site created");

        let reconcile = self.reconciler.reconcile(Mutation::SiteAdded(id)).await;
        Ok(Mutated {
            record: self.get_site(id)?,
            reconcile,
        })
    }

    pub async fn update_site(&self, id: i64, input: SiteInput) -> PanelResult<Mutated<SiteRecord>> {
        validate_site_input(&input)?;
        if !self.db.update_site(id, &input)? {
            return Err(PanelError::not_found("site", id));
        }

        let reconcile = self.reconciler.reconcile(Mutation::SiteUpdated(id)).await;
        Ok(Mutated {
            record: self.get_site(id)?,
            reconcile,
        })
    }

    pub async fn delete_site(&self, id: i64) -> PanelResult<ReconcileReport> {
        if !self.db.delete_site(id)? {
            return Err(PanelError::not_found("site", id));
        }
        info!(site_id = id, "Site deleted");
        Ok(self.reconciler.reconcile(Mutation::SiteDeleted(id)).await)
    }

    // ==================== Proxy ====================

    /// Write the current Caddyfile, then start Caddy
    pub async fn proxy_start(&self) -> PanelResult<()> {
        self.reconciler.publish().await?;
        match self.proxy.start().await {
            Ok(()) => Ok(()),
            Err(e) => Err(diagnose_proxy_error(e).await),
        }
    }

    pub async fn proxy_stop(&self) -> PanelResult<()> {
        if !self.proxy.is_running().await {
            return Err(diagnose_proxy_error(ProxyError::NotRunning).await);
        }
        self.proxy.stop().await;
        Ok(())
    }

    pub async fn proxy_restart(&self) -> PanelResult<()> {
        self.reconciler.publish().await?;
        match self.proxy.restart().await {
            Ok(()) => Ok(()),
            Err(e) => Err(diagnose_proxy_error(e).await),
        }
    }

    pub async fn proxy_reload(&self) -> PanelResult<()> {
        self.reconciler.publish().await?;
        match self.proxy.reload().await {
            Ok(()) => Ok(()),
            Err(e) => Err(diagnose_proxy_error(e).await),
        }
    }

    pub async fn proxy_status(&self) -> ProxyStatus {
        self.proxy.status().await
    }

    pub fn proxy_logs(&self, lines: usize) -> PanelResult<Vec<String>> {
        match self.proxy.logs(lines) {
            Ok(lines) => Ok(lines),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![NO_LOGS_PLACEHOLDER.to_string()]),
            Err(e) => Err(PanelError::Store(e.into())),
        }
    }

    pub fn proxy_ssl_status(&self) -> SslStatus {
        self.proxy.ssl_status()
    }

    // ==================== Settings ====================

    pub fn settings(&self) -> PanelResult<BTreeMap<String, String>> {
        Ok(self.db.all_settings()?)
    }

    /// Apply editable settings; unknown keys reject the whole update
    pub fn update_settings(&self, updates: BTreeMap<String, String>) -> PanelResult<BTreeMap<String, String>> {
        if let Some(key) = updates.keys().find(|k| !EDITABLE_SETTINGS.contains(&k.as_str())) {
            return Err(PanelError::Invalid(format!("setting '{}' cannot be changed", key)));
        }

        if let Some(root) = updates.get(SETTING_WWW_ROOT) {
            let root = root.trim();
            if root.is_empty() {
                return Err(PanelError::Invalid("www_root must not be empty".to_string()));
            }
            std::fs::create_dir_all(root)
                .map_err(|e| PanelError::Invalid(format!("cannot create {}: {}", root, e)))?;
        }

        for (key, value) in &updates {
            self.db.set_setting(key, value.trim())?;
            info!(key = %key, "Setting updated");
        }
        self.settings()
    }

    // ==================== Tasks ====================

    pub fn list_tasks(&self) -> PanelResult<Vec<TaskRecord>> {
        Ok(self.db.list_tasks()?)
    }

    pub fn add_task(&self, input: TaskInput) -> PanelResult<TaskRecord> {
        if input.name.trim().is_empty() {
            return Err(PanelError::Invalid("task name is required".to_string()));
        }
        if input.command.trim().is_empty() {
            return Err(PanelError::Invalid("task command is required".to_string()));
        }

        let id = self.db.create_task(&input)?;
        self.db
            .get_task(id)?
            .ok_or_else(|| PanelError::not_found("task", id))
    }

    pub fn delete_task(&self, id: i64) -> PanelResult<()> {
        if !self.db.delete_task(id)? {
            return Err(PanelError::not_found("task", id));
        }
        Ok(())
    }

    /// Run a task once and record the outcome
    pub async fn run_task(&self, id: i64) -> PanelResult<TaskRun> {
        let task = self
            .db
            .get_task(id)?
            .ok_or_else(|| PanelError::not_found("task", id))?;

        let outcome = tasks::run_command(&task.command).await;
        self.db.set_task_run(id, outcome.status())?;

        let task = self
            .db
            .get_task(id)?
            .ok_or_else(|| PanelError::not_found("task", id))?;
        Ok(TaskRun { task, outcome })
    }

    // ==================== Diagnostics ====================

    pub async fn diagnostics(&self) -> PanelResult<DiagnosticReport> {
        tokio::task::spawn_blocking(diagnostics::run_diagnostics)
            .await
            .map_err(|e| PanelError::Store(e.into()))
    }

    pub async fn check_ssl(&self, domain: &str) -> PanelResult<Vec<Issue>> {
        let domain = domain.trim();
        if !is_valid_domain(domain) {
            return Err(PanelError::Invalid(format!("invalid domain: {}", domain)));
        }
        Ok(diagnostics::check_ssl(domain).await)
    }

    pub async fn auto_fix(&self, action: FixAction) -> PanelResult<String> {
        let message = tokio::task::spawn_blocking(move || diagnostics::auto_fix(action))
            .await
            .map_err(|e| PanelError::Store(e.into()))??;
        Ok(message)
    }

    // ==================== Shutdown ====================

    /// Stop Caddy and every project process
    pub async fn shutdown(&self) {
        info!("Stopping Caddy and project processes");
        self.proxy.stop().await;
        self.supervisor.stop_all().await;
    }
}

/// Reject unusable input; returns warnings for domain lines that will be skipped
fn validate_project_input(input: &ProjectInput) -> PanelResult<Vec<String>> {
    if input.name.trim().is_empty() {
        return Err(PanelError::Invalid("project name is required".to_string()));
    }
    if input.port == 0 {
        return Err(PanelError::Invalid("port must be between 1 and 65535".to_string()));
    }

    Ok(input
        .domains
        .lines()
        .map(str::trim)
        .filter(|d| !d.is_empty() && !is_valid_domain(d))
        .map(|d| format!("domain '{}' is invalid and will not be routed", d))
        .collect())
}

fn validate_site_input(input: &SiteInput) -> PanelResult<()> {
    if !is_valid_domain(input.domain.trim()) {
        return Err(PanelError::Invalid(format!("invalid domain: {}", input.domain)));
    }
    if input.target.trim().is_empty() {
        return Err(PanelError::Invalid("site target is required".to_string()));
    }
    Ok(())
}
