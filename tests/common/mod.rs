//! Shared test fixtures

#![allow(dead_code)]

use caddy_manager::caddyfile::Renderer;
use caddy_manager::db::{Database, ProjectInput};
use caddy_manager::panel::Panel;
use caddy_manager::process::{ProcessSupervisor, RuntimeKind};
use caddy_manager::proxy::{ProxyControl, ProxyError, ProxyStatus};
use caddy_manager::reconcile::Reconciler;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Proxy that records lifecycle calls instead of running Caddy
#[derive(Default)]
pub struct RecordingProxy {
    calls: Mutex<Vec<&'static str>>,
    running: Mutex<bool>,
    pub fail_reload: Mutex<bool>,
    pub fail_start: Mutex<bool>,
}

impl RecordingProxy {
    /// A proxy that is already up
    pub fn running() -> Self {
        let proxy = Self::default();
        *proxy.running.lock() = true;
        proxy
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }

    fn launch(&self, call: &'static str) -> Result<(), ProxyError> {
        self.record(call);
        if *self.fail_start.lock() {
            return Err(ProxyError::NotInstalled("/nonexistent/caddy".into()));
        }
        *self.running.lock() = true;
        Ok(())
    }
}

impl ProxyControl for RecordingProxy {
    fn start(&self) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(async move { self.launch("start") })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record("stop");
            *self.running.lock() = false;
        })
    }

    fn restart(&self) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(async move { self.launch("restart") })
    }

    fn reload(&self) -> BoxFuture<'_, Result<(), ProxyError>> {
        Box::pin(async move {
            self.record("reload");
            if !*self.running.lock() {
                return Err(ProxyError::NotRunning);
            }
            if *self.fail_reload.lock() {
                return Err(ProxyError::ReloadFailed("bad config".to_string()));
            }
            Ok(())
        })
    }

    fn is_running(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { *self.running.lock() })
    }

    fn status(&self) -> BoxFuture<'_, ProxyStatus> {
        Box::pin(async move {
            ProxyStatus {
                running: *self.running.lock(),
                installed: true,
                binary: "caddy".to_string(),
                version: Some("v2.10.2".to_string()),
            }
        })
    }

    fn logs(&self, lines: usize) -> std::io::Result<Vec<String>> {
        Ok(vec!["serving initial configuration".to_string(); lines.min(1)])
    }
}

/// Every component wired together against a temp directory
pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub db: Arc<Database>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub proxy: Arc<RecordingProxy>,
    pub reconciler: Arc<Reconciler>,
    pub panel: Arc<Panel>,
}

impl Harness {
    /// Wired to a proxy that is not running yet
    pub fn new() -> Self {
        Self::with_proxy(RecordingProxy::default())
    }

    pub fn with_proxy(proxy: RecordingProxy) -> Self {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let db = Arc::new(Database::open(tmp.path().join("caddy-manager.db")).expect("open db"));
        let supervisor = ProcessSupervisor::new(Arc::clone(&db), tmp.path().join("logs"));
        let proxy = Arc::new(proxy);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&db),
            Renderer::new("localhost:9000"),
            tmp.path().join("caddy").join("Caddyfile"),
            proxy.clone() as Arc<dyn ProxyControl>,
            Arc::clone(&supervisor),
        ));
        let panel = Arc::new(Panel::new(
            Arc::clone(&db),
            Arc::clone(&supervisor),
            proxy.clone() as Arc<dyn ProxyControl>,
            Arc::clone(&reconciler),
            tmp.path().join("www"),
        ));

        Self {
            tmp,
            db,
            supervisor,
            proxy,
            reconciler,
            panel,
        }
    }

    pub fn caddyfile_path(&self) -> PathBuf {
        self.tmp.path().join("caddy").join("Caddyfile")
    }

    pub fn caddyfile(&self) -> String {
        std::fs::read_to_string(self.caddyfile_path()).unwrap_or_default()
    }

    /// Put the fake proxy in the running state
    pub async fn proxy_start(&self) {
        self.proxy.start().await.expect("fake proxy start");
    }

    pub fn root_dir(&self) -> String {
        self.tmp.path().to_string_lossy().to_string()
    }
}

pub fn project_input(name: &str, port: u16, start_command: &str) -> ProjectInput {
    ProjectInput {
        name: name.to_string(),
        project_type: RuntimeKind::Command,
        root_dir: String::new(),
        exec_path: String::new(),
        start_command: start_command.to_string(),
        port,
        auto_start: false,
        domains: String::new(),
        ssl_enabled: true,
        ssl_email: String::new(),
        reverse_proxy_path: "/".to_string(),
        extra_headers: String::new(),
        description: String::new(),
        use_ipv4: true,
    }
}

/// A port nothing is listening on
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
