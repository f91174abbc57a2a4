use crate::db::{Database, ProjectRecord};
use crate::diagnostics;
use crate::error::{classify_start_failure, StartError, StopError};
use crate::logs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, warn};

/// How long stop waits for a killed process to be reaped
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How a project's start configuration is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuntimeKind {
    /// Native executable (exec path, else first token of the start command)
    #[serde(rename = "go", alias = "binary")]
    Binary,
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "nodejs", alias = "node")]
    Node,
    #[serde(rename = "java")]
    Java,
    /// Start command run as-is
    #[default]
    #[serde(rename = "command", alias = "custom")]
    Command,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Binary => "go",
            RuntimeKind::Python => "python",
            RuntimeKind::Node => "nodejs",
            RuntimeKind::Java => "java",
            RuntimeKind::Command => "command",
        }
    }

    /// Parse a stored kind; anything unknown runs as a plain command
    pub fn from_name(name: &str) -> Self {
        match name {
            "go" | "binary" => RuntimeKind::Binary,
            "python" => RuntimeKind::Python,
            "nodejs" | "node" => RuntimeKind::Node,
            "java" => RuntimeKind::Java,
            _ => RuntimeKind::Command,
        }
    }

    /// Interpreter that runs the start command, if any
    pub fn interpreter(&self) -> Option<&'static str> {
        match self {
            RuntimeKind::Python if cfg!(windows) => Some("python"),
            RuntimeKind::Python => Some("python3"),
            RuntimeKind::Node => Some("node"),
            RuntimeKind::Java => Some("java"),
            RuntimeKind::Binary | RuntimeKind::Command => None,
        }
    }

    pub fn is_interpreted(&self) -> bool {
        self.interpreter().is_some()
    }

    pub fn download_url(&self) -> Option<&'static str> {
        match self {
            RuntimeKind::Python => Some("https://www.python.org/downloads/"),
            RuntimeKind::Node => Some("https://nodejs.org/"),
            RuntimeKind::Java => Some("https://adoptium.net/"),
            RuntimeKind::Binary | RuntimeKind::Command => None,
        }
    }

    pub fn version_command(&self) -> Option<String> {
        match self {
            RuntimeKind::Java => Some("java -version".to_string()),
            kind => kind.interpreter().map(|i| format!("{} --version", i)),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeKind::Binary => "Native binary",
            RuntimeKind::Python => "Python",
            RuntimeKind::Node => "Node.js",
            RuntimeKind::Java => "Java",
            RuntimeKind::Command => "Command",
        };
        f.write_str(name)
    }
}

/// Observed state of a project process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Running,
    Stopped,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Running => "running",
            ProjectStatus::Stopped => "stopped",
        }
    }

    pub fn from_name(name: &str) -> Self {
        if name == "running" {
            ProjectStatus::Running
        } else {
            ProjectStatus::Stopped
        }
    }
}

/// Everything needed to launch a project process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub runtime: RuntimeKind,
    pub root_dir: String,
    pub exec_path: String,
    pub start_command: String,
    pub port: u16,
}

impl From<&ProjectRecord> for LaunchSpec {
    fn from(project: &ProjectRecord) -> Self {
        Self {
            runtime: project.project_type,
            root_dir: project.root_dir.clone(),
            exec_path: project.exec_path.clone(),
            start_command: project.start_command.clone(),
            port: project.port,
        }
    }
}

impl LaunchSpec {
    /// Resolve the program and arguments to execute
    pub fn resolve(&self) -> Result<(String, Vec<String>), StartError> {
        let exec = self.exec_path.trim();
        let tokens = tokenize(self.start_command.trim());

        if let Some(interpreter) = self.runtime.interpreter() {
            return if !tokens.is_empty() {
                Ok((interpreter.to_string(), tokens))
            } else if !exec.is_empty() {
                Ok((interpreter.to_string(), vec![exec.to_string()]))
            } else {
                Err(StartError::NoStartConfig)
            };
        }

        let from_tokens = tokens
            .split_first()
            .map(|(program, args)| (program.clone(), args.to_vec()));
        let from_exec = (!exec.is_empty()).then(|| (exec.to_string(), Vec::new()));

        let resolved = match self.runtime {
            RuntimeKind::Binary => from_exec.or(from_tokens),
            _ => from_tokens.or(from_exec),
        };
        resolved.ok_or(StartError::NoStartConfig)
    }

    /// Problems that would prevent a launch; empty when the launch looks runnable
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let root = self.root_dir.trim();

        if root.is_empty() {
            problems.push("project root directory is not set".to_string());
        } else if !Path::new(root).is_dir() {
            problems.push(format!("project root directory does not exist: {}", root));
        }

        if self.port == 0 {
            problems.push("invalid port 0 (must be 1-65535)".to_string());
        }

        let exec = self.exec_path.trim();
        if !exec.is_empty() {
            let path = Path::new(exec);
            let in_root = !root.is_empty() && path.is_relative() && Path::new(root).join(path).exists();
            if !path.exists() && !in_root {
                problems.push(format!("executable does not exist: {}", exec));
            }
        }

        if exec.is_empty() && self.start_command.trim().is_empty() {
            problems.push("no start command or executable path configured".to_string());
        }

        problems
    }
}

/// Split a start command with shell quoting rules, falling back to whitespace
fn tokenize(command: &str) -> Vec<String> {
    shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(str::to_string).collect())
}

/// In-memory handle for a live project process
struct RunningProcess {
    pid: Option<u32>,
    /// Distinguishes this launch from later launches of the same project
    generation: u64,
    started_at: Instant,
    /// Asks the watcher to kill the child; it answers once the child is reaped
    kill_tx: oneshot::Sender<oneshot::Sender<()>>,
}

/// Supervises project processes.
///
/// Returned as `Arc<Self>` because every start spawns a watcher task that
/// holds a reference back to the supervisor. All mutations of the handle
/// map (start, stop, stop_all, watcher cleanup) take the write lock, which
/// keeps at most one live handle per project id.
pub struct ProcessSupervisor {
    processes: RwLock<HashMap<i64, RunningProcess>>,
    db: Arc<Database>,
    log_dir: PathBuf,
    next_generation: AtomicU64,
    kill_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(db: Arc<Database>, log_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            db,
            log_dir: log_dir.into(),
            next_generation: AtomicU64::new(1),
            kill_timeout: KILL_TIMEOUT,
        })
    }

    /// Log file receiving a project's stdout and stderr
    pub fn log_path(&self, id: i64) -> PathBuf {
        self.log_dir.join(format!("project_{}.log", id))
    }

    /// Launch a project, replacing any process already running for `id`.
    /// Returns the new pid.
    pub async fn start(self: &Arc<Self>, id: i64, spec: &LaunchSpec) -> Result<u32, StartError> {
        let (program, args) = spec.resolve()?;

        let mut processes = self.processes.write().await;

        if let Some(existing) = processes.remove(&id) {
            info!(project_id = id, pid = ?existing.pid, "Terminating previous process before restart");
            if let Err(e) = terminate(existing, self.kill_timeout).await {
                warn!(project_id = id, error = %e, "Previous process did not stop cleanly");
            }
        }

        // Past this point nothing is tracked for `id`, so every failure
        // leaves the project stopped in the store
        let (stdout, stderr) = self.open_log(id, &program, &args).map_err(|e| {
            self.mark_stopped(id);
            StartError::Failed(format!("cannot open log file: {}", e))
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.env("PORT", spec.port.to_string());

        let root = spec.root_dir.trim();
        if !root.is_empty() {
            cmd.current_dir(root);
        }

        let child = cmd.spawn().map_err(|e| {
            let err = classify_start_failure(spec.runtime, &program, spec.port, &e.to_string());
            warn!(project_id = id, program = %program, error = %e, code = err.code(), "Failed to spawn project process");
            self.mark_stopped(id);
            err
        })?;

        let pid = child.id().unwrap_or(0);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();

        processes.insert(
            id,
            RunningProcess {
                pid: child.id(),
                generation,
                started_at: Instant::now(),
                kill_tx,
            },
        );

        if let Err(e) = self.db.update_project_status(id, ProjectStatus::Running) {
            warn!(project_id = id, error = %e, "Failed to persist running status");
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.watch(id, generation, child, kill_rx).await;
        });

        info!(project_id = id, pid, program = %program, "Project process spawned");
        Ok(pid)
    }

    /// Wait for the child to exit, or kill it on request
    async fn watch(
        self: Arc<Self>,
        id: i64,
        generation: u64,
        mut child: Child,
        kill_rx: oneshot::Receiver<oneshot::Sender<()>>,
    ) {
        let pid = child.id();

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(project_id = id, ?pid, %status, "Project process exited"),
                    Err(e) => error!(project_id = id, ?pid, error = %e, "Failed to wait for project process"),
                }

                let mut processes = self.processes.write().await;
                let is_current = processes.get(&id).map(|p| p.generation) == Some(generation);
                if is_current {
                    processes.remove(&id);
                    drop(processes);
                    self.mark_stopped(id);
                } else {
                    debug!(project_id = id, generation, "Exit of superseded process ignored");
                }
            }
            Ok(ack) = kill_rx => {
                if let Err(e) = child.kill().await {
                    warn!(project_id = id, ?pid, error = %e, "Failed to kill project process");
                }
                let _ = ack.send(());
            }
        }
    }

    /// Kill a project's process. Succeeds when nothing is running.
    pub async fn stop(&self, id: i64) -> Result<(), StopError> {
        let mut processes = self.processes.write().await;
        let Some(process) = processes.remove(&id) else {
            debug!(project_id = id, "Stop requested but no process is tracked");
            return Ok(());
        };

        info!(
            project_id = id,
            pid = ?process.pid,
            uptime_secs = process.started_at.elapsed().as_secs(),
            "Stopping project process"
        );
        let result = terminate(process, self.kill_timeout).await;
        drop(processes);

        self.mark_stopped(id);
        result
    }

    /// Kill every tracked process and mark each project stopped
    pub async fn stop_all(&self) {
        let mut processes = self.processes.write().await;
        let drained: Vec<(i64, RunningProcess)> = processes.drain().collect();
        info!(count = drained.len(), "Stopping all project processes");

        let timeout = self.kill_timeout;
        let results = futures::future::join_all(
            drained
                .into_iter()
                .map(|(id, process)| async move { (id, terminate(process, timeout).await) }),
        )
        .await;
        drop(processes);

        for (id, result) in results {
            if let Err(e) = result {
                warn!(project_id = id, error = %e, "Process did not stop cleanly");
            }
            self.mark_stopped(id);
        }
    }

    /// Running when a handle exists; otherwise whether something listens on `port`
    pub async fn status(&self, id: i64, port: u16) -> ProjectStatus {
        if self.processes.read().await.contains_key(&id) {
            return ProjectStatus::Running;
        }
        if port == 0 {
            return ProjectStatus::Stopped;
        }

        let listening = tokio::task::spawn_blocking(move || diagnostics::port_in_use(port))
            .await
            .unwrap_or(false);
        if listening {
            ProjectStatus::Running
        } else {
            ProjectStatus::Stopped
        }
    }

    /// Whether a live handle exists for `id`
    pub async fn is_tracked(&self, id: i64) -> bool {
        self.processes.read().await.contains_key(&id)
    }

    pub async fn pid(&self, id: i64) -> Option<u32> {
        self.processes.read().await.get(&id).and_then(|p| p.pid)
    }

    /// Ids with a live handle, sorted
    pub async fn tracked_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.processes.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Last `lines` lines of a project's log
    pub fn logs(&self, id: i64, lines: usize) -> std::io::Result<Vec<String>> {
        logs::tail_lines(&self.log_path(id), lines)
    }

    fn mark_stopped(&self, id: i64) {
        if let Err(e) = self.db.update_project_status(id, ProjectStatus::Stopped) {
            warn!(project_id = id, error = %e, "Failed to persist stopped status");
        }
    }

    /// Open the append-only log and return handles for stdout and stderr
    fn open_log(&self, id: i64, program: &str, args: &[String]) -> std::io::Result<(Stdio, Stdio)> {
        std::fs::create_dir_all(&self.log_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(id))?;

        writeln!(
            file,
            "=== {} starting: {} {} ===",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            program,
            args.join(" ")
        )?;

        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

/// Hand the kill to the watcher and wait until the child is reaped
async fn terminate(process: RunningProcess, timeout: Duration) -> Result<(), StopError> {
    let (ack_tx, ack_rx) = oneshot::channel();

    // A closed channel means the watcher already saw the exit
    if process.kill_tx.send(ack_tx).is_err() {
        return Ok(());
    }

    match tokio::time::timeout(timeout, ack_rx).await {
        Ok(_) => Ok(()),
        Err(_) => Err(StopError::Timeout {
            pid: process.pid.unwrap_or(0),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProjectInput;

    fn stored_project(db: &Database, name: &str) -> i64 {
        db.create_project(&ProjectInput {
            name: name.to_string(),
            project_type: RuntimeKind::Command,
            root_dir: String::new(),
            exec_path: String::new(),
            start_command: "sleep 30".to_string(),
            port: 0,
            auto_start: false,
            domains: String::new(),
            ssl_enabled: false,
            ssl_email: String::new(),
            reverse_proxy_path: "/".to_string(),
            extra_headers: String::new(),
            description: String::new(),
            use_ipv4: true,
        })
        .unwrap()
    }

    fn stored_status(db: &Database, id: i64) -> ProjectStatus {
        db.get_project(id).unwrap().unwrap().status
    }

    fn spec(runtime: RuntimeKind, exec_path: &str, start_command: &str) -> LaunchSpec {
        LaunchSpec {
            runtime,
            root_dir: String::new(),
            exec_path: exec_path.to_string(),
            start_command: start_command.to_string(),
            port: 8080,
        }
    }

    #[test]
    fn test_resolve_native_binary_prefers_exec_path() {
        let (program, args) = spec(RuntimeKind::Binary, "/opt/app/server", "ignored --flag")
            .resolve()
            .unwrap();
        assert_eq!(program, "/opt/app/server");
        assert!(args.is_empty());

        let (program, args) = spec(RuntimeKind::Binary, "", "./server --port 8080").resolve().unwrap();
        assert_eq!(program, "./server");
        assert_eq!(args, vec!["--port", "8080"]);
    }

    #[test]
    fn test_resolve_interpreted_runtimes() {
        let (program, args) = spec(RuntimeKind::Node, "", "server.js --prod").resolve().unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, vec!["server.js", "--prod"]);

        let (program, args) = spec(RuntimeKind::Java, "", "-jar app.jar").resolve().unwrap();
        assert_eq!(program, "java");
        assert_eq!(args, vec!["-jar", "app.jar"]);

        let (program, args) = spec(RuntimeKind::Python, "main.py", "").resolve().unwrap();
        assert_eq!(Some(program.as_str()), RuntimeKind::Python.interpreter());
        assert_eq!(args, vec!["main.py"]);
    }

    #[test]
    fn test_resolve_generic_command_with_quotes() {
        let (program, args) = spec(RuntimeKind::Command, "", r#"sh -c "echo 'hi there'""#)
            .resolve()
            .unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-c", "echo 'hi there'"]);
    }

    #[test]
    fn test_resolve_unbalanced_quotes_fall_back_to_whitespace() {
        let (program, args) = spec(RuntimeKind::Command, "", r#"echo "unterminated"#).resolve().unwrap();
        assert_eq!(program, "echo");
        assert_eq!(args, vec!["\"unterminated"]);
    }

    #[test]
    fn test_resolve_without_start_config() {
        for runtime in [
            RuntimeKind::Binary,
            RuntimeKind::Python,
            RuntimeKind::Node,
            RuntimeKind::Java,
            RuntimeKind::Command,
        ] {
            let err = spec(runtime, "  ", "   ").resolve().unwrap_err();
            assert!(matches!(err, StartError::NoStartConfig), "runtime {:?}", runtime);
        }
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut launch = spec(RuntimeKind::Binary, "/definitely/missing/binary", "");
        launch.root_dir = "/definitely/missing/root".to_string();
        launch.port = 0;

        let problems = launch.validate();
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("root directory does not exist")));
        assert!(problems.iter().any(|p| p.contains("invalid port")));
        assert!(problems.iter().any(|p| p.contains("executable does not exist")));

        let empty = spec(RuntimeKind::Command, "", "");
        let problems = empty.validate();
        assert!(problems.iter().any(|p| p.contains("root directory is not set")));
        assert!(problems.iter().any(|p| p.contains("no start command")));
    }

    #[test]
    fn test_validate_accepts_exec_relative_to_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("server"), "").unwrap();

        let mut launch = spec(RuntimeKind::Binary, "server", "");
        launch.root_dir = tmp.path().to_string_lossy().to_string();
        assert!(launch.validate().is_empty());
    }

    #[test]
    fn test_runtime_kind_names() {
        assert_eq!(RuntimeKind::from_name("go"), RuntimeKind::Binary);
        assert_eq!(RuntimeKind::from_name("nodejs"), RuntimeKind::Node);
        assert_eq!(RuntimeKind::from_name("php"), RuntimeKind::Command);
        assert_eq!(RuntimeKind::Node.as_str(), "nodejs");
        assert_eq!(RuntimeKind::Java.version_command().as_deref(), Some("java -version"));

        let kind: RuntimeKind = serde_json::from_str("\"node\"").unwrap();
        assert_eq!(kind, RuntimeKind::Node);
        assert_eq!(serde_json::to_string(&RuntimeKind::Binary).unwrap(), "\"go\"");
    }

    #[test]
    fn test_project_status_names() {
        assert_eq!(ProjectStatus::from_name("running"), ProjectStatus::Running);
        assert_eq!(ProjectStatus::from_name("anything"), ProjectStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_unknown_project_is_ok() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let supervisor = ProcessSupervisor::new(db, std::env::temp_dir());

        assert!(supervisor.stop(42).await.is_ok());
        assert_eq!(supervisor.status(42, 0).await, ProjectStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_without_config_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let supervisor = ProcessSupervisor::new(db, tmp.path());

        let err = supervisor.start(1, &spec(RuntimeKind::Command, "", "")).await.unwrap_err();
        assert!(matches!(err, StartError::NoStartConfig));
        assert!(!supervisor.is_tracked(1).await);
    }

    #[tokio::test]
    async fn test_start_missing_executable_is_classified() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let supervisor = ProcessSupervisor::new(db, tmp.path());

        let missing = tmp.path().join("no-such-binary");
        let launch = spec(RuntimeKind::Binary, &missing.to_string_lossy(), "");
        let err = supervisor.start(1, &launch).await.unwrap_err();

        assert_eq!(err.code(), "FILE_NOT_FOUND");
        assert!(!supervisor.is_tracked(1).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_continues_past_failed_kill() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut supervisor = ProcessSupervisor::new(Arc::clone(&db), tmp.path());
        Arc::get_mut(&mut supervisor).unwrap().kill_timeout = Duration::from_millis(200);

        let live = stored_project(&db, "live");
        let stuck = stored_project(&db, "stuck");

        let mut launch = spec(RuntimeKind::Command, "", "sleep 30");
        launch.root_dir = tmp.path().to_string_lossy().to_string();
        supervisor.start(live, &launch).await.unwrap();

        // a handle whose watcher never acknowledges the kill
        let (kill_tx, _kill_rx) = oneshot::channel();
        supervisor.processes.write().await.insert(
            stuck,
            RunningProcess {
                pid: None,
                generation: 0,
                started_at: Instant::now(),
                kill_tx,
            },
        );
        db.update_project_status(stuck, ProjectStatus::Running).unwrap();

        supervisor.stop_all().await;

        assert!(supervisor.tracked_ids().await.is_empty());
        assert_eq!(stored_status(&db, live), ProjectStatus::Stopped);
        assert_eq!(stored_status(&db, stuck), ProjectStatus::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_reports_kill_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut supervisor = ProcessSupervisor::new(Arc::clone(&db), tmp.path());
        Arc::get_mut(&mut supervisor).unwrap().kill_timeout = Duration::from_millis(100);

        let stuck = stored_project(&db, "stuck");
        let (kill_tx, _kill_rx) = oneshot::channel();
        supervisor.processes.write().await.insert(
            stuck,
            RunningProcess {
                pid: Some(4242),
                generation: 0,
                started_at: Instant::now(),
                kill_tx,
            },
        );

        let err = supervisor.stop(stuck).await.unwrap_err();
        assert!(matches!(err, StopError::Timeout { pid: 4242, .. }));
        assert!(!supervisor.is_tracked(stuck).await);
        assert_eq!(stored_status(&db, stuck), ProjectStatus::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_replacement_leaves_project_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let supervisor = ProcessSupervisor::new(Arc::clone(&db), tmp.path());
        let id = stored_project(&db, "replaced");

        let mut launch = spec(RuntimeKind::Command, "", "sleep 30");
        launch.root_dir = tmp.path().to_string_lossy().to_string();
        supervisor.start(id, &launch).await.unwrap();
        assert_eq!(stored_status(&db, id), ProjectStatus::Running);

        let mut broken = launch.clone();
        broken.start_command = "/no/such/binary-xyz".to_string();
        let err = supervisor.start(id, &broken).await.unwrap_err();

        assert_eq!(err.code(), "FILE_NOT_FOUND");
        assert!(!supervisor.is_tracked(id).await);
        assert_eq!(stored_status(&db, id), ProjectStatus::Stopped);
    }
}
