//! Best-effort environment checks
//!
//! Port occupancy, privilege level and firewall rules explain most start
//! failures of Caddy and of project processes. Every check degrades to a
//! conservative answer instead of failing.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::process::Command;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved addresses starting with these belong to Cloudflare's proxy
const CLOUDFLARE_PREFIXES: &[&str] = &["104.21.", "172.67.", "104.18."];

/// Whether something is listening on `port`
///
/// A bind on all interfaces failing with `AddrInUse` is conclusive. Any
/// other outcome is confirmed with a loopback connect once the test
/// listener is closed, which catches loopback-only listeners on platforms
/// that let the wildcard bind succeed.
pub fn port_in_use(port: u16) -> bool {
    let bound = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port));
    match bound {
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => return true,
        Ok(listener) => drop(listener),
        Err(_) => {}
    }

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_ok()
}

/// Port occupancy with the owning process when it can be identified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortCheck {
    pub port: u16,
    pub in_use: bool,
    pub owner_pid: Option<u32>,
    pub owner: Option<String>,
}

pub fn check_port(port: u16) -> PortCheck {
    let in_use = port_in_use(port);
    let owner_pid = if in_use { port_owner_pid(port) } else { None };
    let owner = owner_pid.and_then(process_name);

    PortCheck {
        port,
        in_use,
        owner_pid,
        owner,
    }
}

/// Pid of the process listening on `port`
#[cfg(windows)]
pub fn port_owner_pid(port: u16) -> Option<u32> {
    let output = Command::new("netstat").args(["-ano", "-p", "TCP"]).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_netstat_listener(&stdout, port)
}

/// Pid of the process listening on `port`
#[cfg(not(windows))]
pub fn port_owner_pid(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

/// Find the pid of a LISTENING row for `port` in `netstat -ano` output
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listener(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{}", port);
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !line.contains("LISTENING") {
            return None;
        }
        if !parts[1].ends_with(&suffix) {
            return None;
        }
        parts.last().and_then(|pid| pid.parse::<u32>().ok())
    })
}

fn process_name(pid: u32) -> Option<String> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.name().to_string_lossy().to_string())
}

/// Whether this process runs with administrator/root rights
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// Whether this process runs with administrator/root rights
#[cfg(windows)]
pub fn is_elevated() -> bool {
    Command::new("net")
        .arg("session")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}

/// Whether inbound rules for Caddy's HTTP and HTTPS ports exist.
/// Only the Windows firewall is inspected; elsewhere this reports true.
pub fn firewall_rules_present() -> bool {
    if !cfg!(windows) {
        return true;
    }

    match Command::new("netsh")
        .args(["advfirewall", "firewall", "show", "rule", "name=all"])
        .output()
    {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout);
            text.contains("Caddy HTTP") && text.contains("Caddy HTTPS")
        }
        Err(e) => {
            debug!(error = %e, "Could not query firewall rules");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Fixes that can be applied automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    #[serde(rename = "kill_port_80")]
    KillPort80,
    #[serde(rename = "kill_port_443")]
    KillPort443,
    ConfigureFirewall,
}

#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub code: &'static str,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub solutions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixAction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub issues: Vec<Issue>,
    pub has_errors: bool,
    pub has_warnings: bool,
    pub checked_at: String,
}

impl DiagnosticReport {
    fn new(issues: Vec<Issue>) -> Self {
        Self {
            has_errors: issues.iter().any(|i| i.severity == Severity::Error),
            has_warnings: issues.iter().any(|i| i.severity == Severity::Warning),
            issues,
            checked_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Run every environment check. Blocking; shells out on some platforms.
pub fn run_diagnostics() -> DiagnosticReport {
    let report = build_report(
        is_elevated(),
        &check_port(80),
        &check_port(443),
        firewall_rules_present(),
    );
    info!(
        issues = report.issues.len(),
        has_errors = report.has_errors,
        "Diagnostics completed"
    );
    report
}

/// Turn raw check results into a report
///
/// Ports held by Caddy itself are expected and not reported.
pub fn build_report(
    elevated: bool,
    http: &PortCheck,
    https: &PortCheck,
    firewall_ok: bool,
) -> DiagnosticReport {
    let mut issues = Vec::new();

    if !elevated {
        issues.push(Issue {
            code: "PRIV_001",
            severity: Severity::Error,
            title: "Missing administrator privileges".to_string(),
            description: "caddy-manager is not elevated; Caddy may be unable to bind ports 80 and 443".to_string(),
            solutions: vec![
                "Restart caddy-manager as administrator (or root)".to_string(),
                "Or grant the Caddy binary the capability to bind low ports".to_string(),
            ],
            fix: None,
        });
    }

    for (check, code, fix, consequence) in [
        (http, "PORT_001", FixAction::KillPort80, "Caddy cannot serve HTTP"),
        (https, "PORT_002", FixAction::KillPort443, "certificates cannot be obtained"),
    ] {
        if !check.in_use || held_by_caddy(check) {
            continue;
        }
        let owner = check.owner.clone().unwrap_or_else(|| "an unknown process".to_string());
        issues.push(Issue {
            code,
            severity: Severity::Error,
            title: format!("Port {} is in use", check.port),
            description: format!("Port {} is held by {}; {}", check.port, owner, consequence),
            solutions: vec![
                format!("Stop {}", owner),
                "Or move the conflicting service to another port".to_string(),
                "Or use the automatic fix to free the port".to_string(),
            ],
            fix: Some(fix),
        });
    }

    if !firewall_ok {
        issues.push(Issue {
            code: "FW_001",
            severity: Severity::Warning,
            title: "Firewall rules not configured".to_string(),
            description: "No inbound rules for ports 80 and 443 were found".to_string(),
            solutions: vec![
                "Use the automatic fix to add the rules".to_string(),
                "Or allow TCP 80 and 443 in the firewall manually".to_string(),
            ],
            fix: Some(FixAction::ConfigureFirewall),
        });
    }

    DiagnosticReport::new(issues)
}

fn held_by_caddy(check: &PortCheck) -> bool {
    check
        .owner
        .as_deref()
        .map(|o| o.to_lowercase().starts_with("caddy"))
        .unwrap_or(false)
}

/// Remediation hints for a failed Caddy launch or reload, built from the
/// privilege level and the owners of ports 80 and 443
pub fn proxy_hints(elevated: bool, http: &PortCheck, https: &PortCheck) -> Vec<String> {
    let mut hints = Vec::new();

    for check in [http, https] {
        if !check.in_use || held_by_caddy(check) {
            continue;
        }
        let owner = check.owner.as_deref().unwrap_or("an unknown process");
        hints.push(format!(
            "Port {} is held by {}; stop it or apply the kill_port_{} fix",
            check.port, owner, check.port
        ));
    }

    if !elevated {
        hints.push("caddy-manager is not elevated; restart it as administrator (or root) so Caddy can bind ports 80 and 443".to_string());
    }

    hints.push("Check the Caddy log for details".to_string());
    hints
}

/// [`proxy_hints`] for the live environment. Blocking.
pub fn diagnose_proxy_failure() -> Vec<String> {
    proxy_hints(is_elevated(), &check_port(80), &check_port(443))
}

#[derive(Debug, thiserror::Error)]
pub enum FixError {
    #[error("no process is listening on port {0}")]
    NoListener(u16),
    #[error("failed to kill process {0}")]
    KillFailed(u32),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("command failed: {0}")]
    Command(String),
}

/// Apply an automatic fix, returning a short description of what was done
pub fn auto_fix(action: FixAction) -> Result<String, FixError> {
    match action {
        FixAction::KillPort80 => kill_port_owner(80),
        FixAction::KillPort443 => kill_port_owner(443),
        FixAction::ConfigureFirewall => configure_firewall(),
    }
}

fn kill_port_owner(port: u16) -> Result<String, FixError> {
    let pid = port_owner_pid(port).ok_or(FixError::NoListener(port))?;

    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    let process = sys.process(sys_pid).ok_or(FixError::NoListener(port))?;
    let name = process.name().to_string_lossy().to_string();

    if !process.kill() {
        return Err(FixError::KillFailed(pid));
    }

    warn!(port, pid, process = %name, "Killed process holding port");
    Ok(format!("stopped {} (pid {}) on port {}", name, pid, port))
}

fn configure_firewall() -> Result<String, FixError> {
    if !cfg!(windows) {
        return Err(FixError::Unsupported("firewall configuration"));
    }

    for (name, port) in [("Caddy HTTP", 80), ("Caddy HTTPS", 443)] {
        let status = Command::new("netsh")
            .args([
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &format!("name={}", name),
                "dir=in",
                "action=allow",
                "protocol=TCP",
                &format!("localport={}", port),
            ])
            .status()
            .map_err(|e| FixError::Command(e.to_string()))?;
        if !status.success() {
            return Err(FixError::Command(format!("netsh exited with {}", status)));
        }
    }

    info!("Firewall rules for ports 80 and 443 added");
    Ok("added firewall rules for ports 80 and 443".to_string())
}

pub fn is_cloudflare_ip(ip: &IpAddr) -> bool {
    let text = ip.to_string();
    CLOUDFLARE_PREFIXES.iter().any(|prefix| text.starts_with(prefix))
}

/// Primary outbound addresses of this host (no packets are sent)
fn local_ips() -> Vec<IpAddr> {
    let probes: [(&str, &str); 2] = [("0.0.0.0:0", "8.8.8.8:80"), ("[::]:0", "[2001:4860:4860::8888]:80")];
    probes
        .iter()
        .filter_map(|(bind, target)| {
            let socket = UdpSocket::bind(bind).ok()?;
            socket.connect(target).ok()?;
            socket.local_addr().ok().map(|a| a.ip())
        })
        .collect()
}

/// Check whether a domain is ready for certificate issuance
pub async fn check_ssl(domain: &str) -> Vec<Issue> {
    let mut issues = Vec::new();

    let resolved: Vec<IpAddr> = match tokio::net::lookup_host((domain, 443)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            issues.push(Issue {
                code: "SSL_001",
                severity: Severity::Error,
                title: "Domain does not resolve".to_string(),
                description: format!("Could not resolve {}: {}", domain, e),
                solutions: vec![
                    "Check the domain spelling".to_string(),
                    "Check the DNS records and resolver settings".to_string(),
                    "Wait for DNS propagation (up to 48 hours)".to_string(),
                ],
                fix: None,
            });
            return issues;
        }
    };

    let cloudflare: Vec<String> = resolved
        .iter()
        .filter(|ip| is_cloudflare_ip(ip))
        .map(IpAddr::to_string)
        .collect();
    if !cloudflare.is_empty() {
        issues.push(Issue {
            code: "SSL_002",
            severity: Severity::Info,
            title: "Cloudflare proxy detected".to_string(),
            description: format!("{} resolves to Cloudflare addresses: {}", domain, cloudflare.join(", ")),
            solutions: vec![
                "Use Cloudflare's Flexible SSL mode".to_string(),
                "Or use Full SSL mode with a certificate on this server".to_string(),
                "Certificates cannot be issued automatically for proxied domains".to_string(),
            ],
            fix: None,
        });
        return issues;
    }

    let locals = tokio::task::spawn_blocking(local_ips).await.unwrap_or_default();
    if !resolved.iter().any(|ip| locals.contains(ip)) {
        let shown: Vec<String> = resolved.iter().map(IpAddr::to_string).collect();
        let local_shown: Vec<String> = locals.iter().map(IpAddr::to_string).collect();
        issues.push(Issue {
            code: "SSL_003",
            severity: Severity::Warning,
            title: "Domain may not point to this server".to_string(),
            description: format!(
                "{} resolves to {}; this host uses {}. Behind NAT or port forwarding this is expected",
                domain,
                shown.join(", "),
                local_shown.join(", ")
            ),
            solutions: vec![
                "Forward ports 80 and 443 to this machine when behind NAT".to_string(),
                "Check the DNS A/AAAA records".to_string(),
            ],
            fix: None,
        });
    }

    let reachable = matches!(
        tokio::time::timeout(REACHABILITY_TIMEOUT, tokio::net::TcpStream::connect((domain, 443))).await,
        Ok(Ok(_))
    );
    if !reachable {
        issues.push(Issue {
            code: "SSL_004",
            severity: Severity::Error,
            title: "Port 443 is unreachable".to_string(),
            description: format!("Could not connect to {}:443", domain),
            solutions: vec![
                "Open TCP 443 in the firewall".to_string(),
                "Check router port forwarding".to_string(),
                "Make sure Caddy is running and listening on 443".to_string(),
            ],
            fix: None,
        });
    }

    issues
}
