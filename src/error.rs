//! Error taxonomy, remediation hints and JSON error responses

use crate::process::RuntimeKind;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Why a project process could not be started
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no start command or executable path configured")]
    NoStartConfig,

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied launching {0}")]
    PermissionDenied(String),

    #[error("port {port} is already in use{}", owner_suffix(.owner))]
    PortInUse { port: u16, owner: Option<String> },

    #[error("{0} is not installed")]
    RuntimeNotInstalled(RuntimeKind),

    #[error("invalid project configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("failed to start process: {0}")]
    Failed(String),
}

fn owner_suffix(owner: &Option<String>) -> String {
    owner
        .as_ref()
        .map(|o| format!(" by {}", o))
        .unwrap_or_default()
}

impl StartError {
    /// Stable code reported to API clients
    pub fn code(&self) -> &'static str {
        match self {
            StartError::NoStartConfig => "NO_START_CONFIG",
            StartError::ExecutableNotFound(_) => "FILE_NOT_FOUND",
            StartError::PermissionDenied(_) => "PERMISSION_DENIED",
            StartError::PortInUse { .. } => "PORT_IN_USE",
            StartError::RuntimeNotInstalled(kind) => match kind {
                RuntimeKind::Python => "PYTHON_NOT_FOUND",
                RuntimeKind::Node => "NODEJS_NOT_FOUND",
                RuntimeKind::Java => "JAVA_NOT_FOUND",
                RuntimeKind::Binary | RuntimeKind::Command => "RUNTIME_NOT_FOUND",
            },
            StartError::InvalidConfig(_) => "CONFIG_ERROR",
            StartError::Failed(_) => "START_FAILED",
        }
    }

    /// Remediation hints shown next to the error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            StartError::NoStartConfig => vec![
                "Set an executable path or a start command for the project".to_string(),
            ],
            StartError::ExecutableNotFound(program) => vec![
                format!("Check that '{}' exists", program),
                "Check the start command and the project root directory".to_string(),
            ],
            StartError::PermissionDenied(program) => vec![
                "Run caddy-manager with administrator privileges".to_string(),
                format!("Check the file permissions of '{}'", program),
            ],
            StartError::PortInUse { port, owner } => {
                let mut hints = vec!["Run the system diagnostics to inspect port usage".to_string()];
                match owner {
                    Some(owner) => hints.push(format!("Stop '{}' which is listening on port {}", owner, port)),
                    None => hints.push(format!("Stop the program listening on port {}", port)),
                }
                hints.push("Or configure the project to use another port".to_string());
                hints
            }
            StartError::RuntimeNotInstalled(kind) => {
                let mut hints = Vec::new();
                if let Some(url) = kind.download_url() {
                    hints.push(format!("Install {} from {}", kind, url));
                }
                hints.push("Make sure the runtime is on the PATH".to_string());
                if let Some(cmd) = kind.version_command() {
                    hints.push(format!("Run '{}' to verify the installation", cmd));
                }
                hints
            }
            StartError::InvalidConfig(problems) => problems.clone(),
            StartError::Failed(_) => vec![
                "Check the project log for details".to_string(),
                "Verify the start command runs from a terminal in the project root".to_string(),
            ],
        }
    }
}

/// Coarse categories recognized in OS spawn-failure messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    NotFound,
    PermissionDenied,
    PortInUse,
}

/// Substrings of OS spawn-failure messages and what they indicate.
/// First match wins. Best effort: wording differs between platforms and locales.
const SPAWN_FAILURE_PATTERNS: &[(&str, FailureKind)] = &[
    ("executable file not found", FailureKind::NotFound),
    ("no such file", FailureKind::NotFound),
    ("cannot find", FailureKind::NotFound),
    ("not found", FailureKind::NotFound),
    ("permission denied", FailureKind::PermissionDenied),
    ("access is denied", FailureKind::PermissionDenied),
    ("address already in use", FailureKind::PortInUse),
    ("only one usage of each socket address", FailureKind::PortInUse),
    ("bind", FailureKind::PortInUse),
];

/// Classify a spawn failure message into a [`StartError`]
///
/// `program` is the executable that was launched and `port` the project's
/// listen port. A missing program for an interpreted runtime means the
/// interpreter itself is absent.
pub fn classify_start_failure(
    runtime: RuntimeKind,
    program: &str,
    port: u16,
    message: &str,
) -> StartError {
    let lower = message.to_lowercase();
    let kind = SPAWN_FAILURE_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, kind)| *kind);

    match kind {
        Some(FailureKind::NotFound) if runtime.is_interpreted() => {
            StartError::RuntimeNotInstalled(runtime)
        }
        Some(FailureKind::NotFound) => StartError::ExecutableNotFound(program.to_string()),
        Some(FailureKind::PermissionDenied) => StartError::PermissionDenied(program.to_string()),
        Some(FailureKind::PortInUse) => StartError::PortInUse { port, owner: None },
        None => StartError::Failed(message.to_string()),
    }
}

/// Why a project process could not be stopped
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("process {pid} did not exit within {timeout_secs}s after kill")]
    Timeout { pid: u32, timeout_secs: u64 },
}

/// Error codes returned by the HTTP API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route or record
    NotFound,
    /// Malformed request body or parameters
    BadRequest,
    /// Project could not be started or stopped
    ProcessError,
    /// Caddy binary is missing
    ProxyNotInstalled,
    /// Caddy is not running
    ProxyNotRunning,
    /// Caddy command failed
    ProxyError,
    /// Requested fix is not available on this platform
    Unsupported,
    /// Unexpected failure
    InternalError,
}

impl ApiErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::ProcessError => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::ProxyNotInstalled => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::ProxyNotRunning => StatusCode::CONFLICT,
            ApiErrorCode::ProxyError => StatusCode::BAD_GATEWAY,
            ApiErrorCode::Unsupported => StatusCode::NOT_IMPLEMENTED,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::ProcessError => "PROCESS_ERROR",
            ApiErrorCode::ProxyNotInstalled => "PROXY_NOT_INSTALLED",
            ApiErrorCode::ProxyNotRunning => "PROXY_NOT_RUNNING",
            ApiErrorCode::ProxyError => "PROXY_ERROR",
            ApiErrorCode::Unsupported => "UNSUPPORTED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// Machine-readable code; start failures use the [`StartError::code`] value
    pub code: String,
    /// Human-readable message
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.as_str().to_string(),
            error: message.into(),
            suggestions: Vec::new(),
            log_path: None,
        }
    }

    /// Body for a failed project start, carrying hints and the log location
    pub fn from_start_error(err: &StartError, log_path: Option<String>) -> Self {
        Self {
            success: false,
            code: err.code().to_string(),
            error: err.to_string(),
            suggestions: err.suggestions(),
            log_path,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}"}}"#,
                self.code,
                self.error.replace('\"', "\\\"")
            )
        })
    }
}

/// Build a JSON error response with the status matching `code`
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    error_body_response(code.status_code(), &ErrorResponse::new(code, message))
}

/// Build a response from a prepared error body
pub fn error_body_response(status: StatusCode, body: &ErrorResponse) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
