//! HTTP API for the control panel
//!
//! Routes are matched on method plus path segments; every handler delegates
//! to [`Panel`] and wraps the result in [`ApiResponse`].

use crate::db::{ProjectInput, SiteInput, TaskInput};
use crate::diagnostics::FixAction;
use crate::error::{error_body_response, json_error_response, ApiErrorCode, ErrorResponse};
use crate::panel::{Panel, PanelError, DEFAULT_LOG_LINES};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upper bound for `?lines=`
const MAX_LOG_LINES: usize = 5000;

/// Time given to the shutdown response before the server stops
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

#[derive(Debug, Deserialize)]
struct FixRequest {
    action: FixAction,
}

#[derive(Debug, Serialize)]
struct Message {
    message: String,
}

impl Message {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Logs {
    lines: Vec<String>,
}

/// Control panel API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    admin_token: String,
    panel: Arc<Panel>,
    /// Stops the server when set to true; `POST /api/app/shutdown` sets it
    shutdown: Arc<watch::Sender<bool>>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        admin_token: impl Into<String>,
        panel: Arc<Panel>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            admin_token: admin_token.into(),
            panel,
            shutdown,
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "API server listening");

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    fn check_auth(&self, req: &Request<hyper::body::Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|auth| auth.strip_prefix("Bearer "))
            .map(|token| token == self.admin_token)
            .unwrap_or(false)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }

        if path == "/version" && method == Method::GET {
            let version = serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized API request");
            return Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"));
        }

        let response = self.route(method, &path, req).await;

        response.or_else(|e| {
            error!(error = %e, "API error");
            Ok(json_error_response(
                ApiErrorCode::InternalError,
                format!("Internal error: {}", e),
            ))
        })
    }

    async fn route(
        &self,
        method: Method,
        path: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let query = req.uri().query().unwrap_or("").to_string();

        match (method, segments.as_slice()) {
            // Projects
            (Method::GET, ["api", "projects"]) => ok(self.panel.list_projects().await),
            (Method::POST, ["api", "projects"]) => {
                let input: ProjectInput = match read_json(req).await {
                    Ok(input) => input,
                    Err(response) => return Ok(response),
                };
                match self.panel.add_project(input).await {
                    Ok(added) => {
                        let warnings = added.reconcile.warnings.clone();
                        respond(StatusCode::CREATED, ApiResponse::ok(added).with_warnings(warnings))
                    }
                    Err(e) => Ok(panel_error(e)),
                }
            }
            (method, ["api", "projects", id, rest @ ..]) => {
                let Some(id) = parse_id(id) else {
                    return Ok(json_error_response(ApiErrorCode::BadRequest, "Invalid project id"));
                };
                self.route_project(method, id, rest, &query, req).await
            }

            // Sites
            (Method::GET, ["api", "sites"]) => ok(self.panel.list_sites()),
            (Method::POST, ["api", "sites"]) => {
                let input: SiteInput = match read_json(req).await {
                    Ok(input) => input,
                    Err(response) => return Ok(response),
                };
                match self.panel.add_site(input).await {
                    Ok(added) => {
                        let warnings = added.reconcile.warnings.clone();
                        respond(StatusCode::CREATED, ApiResponse::ok(added).with_warnings(warnings))
                    }
                    Err(e) => Ok(panel_error(e)),
                }
            }
            (method, ["api", "sites", id]) => {
                let Some(id) = parse_id(id) else {
                    return Ok(json_error_response(ApiErrorCode::BadRequest, "Invalid site id"));
                };
                match method {
                    Method::GET => ok(self.panel.get_site(id)),
                    Method::PUT => {
                        let input: SiteInput = match read_json(req).await {
                            Ok(input) => input,
                            Err(response) => return Ok(response),
                        };
                        match self.panel.update_site(id, input).await {
                            Ok(updated) => {
                                let warnings = updated.reconcile.warnings.clone();
                                respond(StatusCode::OK, ApiResponse::ok(updated).with_warnings(warnings))
                            }
                            Err(e) => Ok(panel_error(e)),
                        }
                    }
                    Method::DELETE => reconciled(self.panel.delete_site(id).await),
                    _ => Ok(not_found()),
                }
            }

            // Proxy
            (Method::GET, ["api", "proxy", "status"]) => ok(Ok(self.panel.proxy_status().await)),
            (Method::GET, ["api", "proxy", "logs"]) => {
                let lines = lines_param(&query);
                ok(self.panel.proxy_logs(lines).map(|lines| Logs { lines }))
            }
            (Method::GET, ["api", "proxy", "ssl"]) => ok(Ok(self.panel.proxy_ssl_status())),
            (Method::POST, ["api", "proxy", action]) => {
                let (result, done) = match *action {
                    "start" => (self.panel.proxy_start().await, "Caddy started"),
                    "stop" => (self.panel.proxy_stop().await, "Caddy stopped"),
                    "restart" => (self.panel.proxy_restart().await, "Caddy restarted"),
                    "reload" => (self.panel.proxy_reload().await, "Caddy configuration reloaded"),
                    _ => return Ok(not_found()),
                };
                ok(result.map(|_| Message::new(done)))
            }

            // Settings
            (Method::GET, ["api", "settings"]) => ok(self.panel.settings()),
            (Method::PUT, ["api", "settings"]) => {
                let updates: BTreeMap<String, String> = match read_json(req).await {
                    Ok(updates) => updates,
                    Err(response) => return Ok(response),
                };
                ok(self.panel.update_settings(updates))
            }

            // Tasks
            (Method::GET, ["api", "tasks"]) => ok(self.panel.list_tasks()),
            (Method::POST, ["api", "tasks"]) => {
                let input: TaskInput = match read_json(req).await {
                    Ok(input) => input,
                    Err(response) => return Ok(response),
                };
                match self.panel.add_task(input) {
                    Ok(task) => respond(StatusCode::CREATED, ApiResponse::ok(task)),
                    Err(e) => Ok(panel_error(e)),
                }
            }
            (Method::DELETE, ["api", "tasks", id]) => match parse_id(id) {
                Some(id) => ok(self.panel.delete_task(id).map(|_| Message::new("Task deleted"))),
                None => Ok(json_error_response(ApiErrorCode::BadRequest, "Invalid task id")),
            },
            (Method::POST, ["api", "tasks", id, "run"]) => match parse_id(id) {
                Some(id) => ok(self.panel.run_task(id).await),
                None => Ok(json_error_response(ApiErrorCode::BadRequest, "Invalid task id")),
            },

            // Diagnostics
            (Method::GET, ["api", "diagnostics"]) => ok(self.panel.diagnostics().await),
            (Method::GET, ["api", "diagnostics", "ssl"]) => match query_param(&query, "domain") {
                Some(domain) => ok(self.panel.check_ssl(&domain).await),
                None => Ok(json_error_response(ApiErrorCode::BadRequest, "Missing domain parameter")),
            },
            (Method::POST, ["api", "diagnostics", "fix"]) => {
                let fix: FixRequest = match read_json(req).await {
                    Ok(fix) => fix,
                    Err(response) => return Ok(response),
                };
                ok(self.panel.auto_fix(fix.action).await.map(Message::new))
            }

            // Application
            (Method::POST, ["api", "app", "shutdown"]) => {
                info!("Shutdown requested over the API");
                let shutdown = Arc::clone(&self.shutdown);
                tokio::spawn(async move {
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                    let _ = shutdown.send(true);
                });
                ok(Ok(Message::new("Shutting down")))
            }

            _ => Ok(not_found()),
        }
    }

    async fn route_project(
        &self,
        method: Method,
        id: i64,
        rest: &[&str],
        query: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        match (method, rest) {
            (Method::GET, []) => ok(self.panel.get_project(id).await),
            (Method::PUT, []) => {
                let input: ProjectInput = match read_json(req).await {
                    Ok(input) => input,
                    Err(response) => return Ok(response),
                };
                match self.panel.update_project(id, input).await {
                    Ok(updated) => {
                        let warnings = updated.reconcile.warnings.clone();
                        respond(StatusCode::OK, ApiResponse::ok(updated).with_warnings(warnings))
                    }
                    Err(e) => Ok(panel_error(e)),
                }
            }
            (Method::DELETE, []) => reconciled(self.panel.delete_project(id).await),
            (Method::POST, ["start"]) => ok(self.panel.start_project(id).await),
            (Method::POST, ["stop"]) => ok(self
                .panel
                .stop_project(id)
                .await
                .map(|_| Message::new("Project stopped"))),
            (Method::POST, ["restart"]) => ok(self.panel.restart_project(id).await),
            (Method::GET, ["status"]) => ok(self.panel.project_status(id).await),
            (Method::GET, ["logs"]) => {
                let lines = lines_param(query);
                ok(self.panel.project_logs(id, lines).map(|lines| Logs { lines }))
            }
            _ => Ok(not_found()),
        }
    }
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn respond<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_string(&body)?))
}

/// 200 with the value, or the error mapped to its API code
fn ok<T: Serialize>(result: Result<T, PanelError>) -> Result<Response<Full<Bytes>>> {
    match result {
        Ok(data) => respond(StatusCode::OK, ApiResponse::ok(data)),
        Err(e) => Ok(panel_error(e)),
    }
}

/// Like [`ok`], surfacing reconciliation warnings at the top level
fn reconciled(result: Result<crate::reconcile::ReconcileReport, PanelError>) -> Result<Response<Full<Bytes>>> {
    match result {
        Ok(report) => {
            let warnings = report.warnings.clone();
            respond(StatusCode::OK, ApiResponse::ok(report).with_warnings(warnings))
        }
        Err(e) => Ok(panel_error(e)),
    }
}

fn panel_error(err: PanelError) -> Response<Full<Bytes>> {
    let code = err.api_code();
    match err {
        PanelError::Start { error, log_path } => {
            warn!(code = error.code(), error = %error, "Project start failed");
            error_body_response(
                code.status_code(),
                &ErrorResponse::from_start_error(&error, Some(log_path)),
            )
        }
        PanelError::Proxy { error, suggestions } => {
            let mut body = ErrorResponse::new(code, error.to_string());
            body.suggestions = suggestions;
            error_body_response(code.status_code(), &body)
        }
        PanelError::Store(e) => {
            error!(error = %e, "Store error");
            json_error_response(code, format!("{:#}", e))
        }
        other => json_error_response(code, other.to_string()),
    }
}

fn not_found() -> Response<Full<Bytes>> {
    json_error_response(ApiErrorCode::NotFound, "Not found")
}

async fn read_json<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(json_error_response(
                ApiErrorCode::BadRequest,
                format!("Failed to read body: {}", e),
            ))
        }
    };

    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ApiErrorCode::BadRequest, format!("Invalid JSON: {}", e)))
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|id| *id > 0)
}

/// Decoded value of a query parameter
fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name != key {
            return None;
        }
        urlencoding::decode(&value.replace('+', " "))
            .ok()
            .map(|v| v.into_owned())
            .filter(|v| !v.is_empty())
    })
}

fn lines_param(query: &str) -> usize {
    query_param(query, "lines")
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .map(|n| n.min(MAX_LOG_LINES))
        .unwrap_or(DEFAULT_LOG_LINES)
}
