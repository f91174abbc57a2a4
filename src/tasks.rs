//! One-shot execution of stored task commands

use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

/// Tasks running longer than this are killed and reported as failed
const TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Captured output kept per stream
const MAX_OUTPUT_BYTES: usize = 4096;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn status(&self) -> &'static str {
        if self.success {
            STATUS_SUCCESS
        } else {
            STATUS_FAILED
        }
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Keep the end of a stream, where errors usually are
fn tail_output(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
}

/// Run `command` through the platform shell and wait for it
pub async fn run_command(command: &str) -> TaskOutcome {
    run_command_with_timeout(command, TASK_TIMEOUT).await
}

pub async fn run_command_with_timeout(command: &str, timeout: Duration) -> TaskOutcome {
    let started = Instant::now();
    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let result = tokio::time::timeout(timeout, cmd.output()).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = match result {
        Ok(Ok(output)) => TaskOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: tail_output(&output.stdout),
            stderr: tail_output(&output.stderr),
            duration_ms,
        },
        Ok(Err(e)) => TaskOutcome {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("failed to run command: {}", e),
            duration_ms,
        },
        Err(_) => TaskOutcome {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("timed out after {}s", timeout.as_secs()),
            duration_ms,
        },
    };

    if outcome.success {
        info!(command, duration_ms, "Task completed");
    } else {
        warn!(command, exit_code = ?outcome.exit_code, stderr = %outcome.stderr, "Task failed");
    }
    outcome
}
