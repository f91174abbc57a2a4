//! Caddyfile rendering
//!
//! Sites and projects are both lowered to [`Routable`] values and rendered
//! by a single code path. Rendering is pure: the same rows in the same order
//! always produce the same bytes, and every write replaces the whole file.

use crate::db::{ProjectRecord, SiteKind, SiteRecord};
use std::io::Write;
use std::path::Path;

const HEADER: &str = "# Caddyfile generated by caddy-manager\n\
# Manual edits are overwritten whenever sites or projects change\n\n";

const DEFAULT_BLOCK: &str = ":80 {\n    respond \"Caddy Manager is running\" 200\n}\n";

const INDENT: &str = "    ";

/// Anything that can be turned into one or more server blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routable {
    Site(SiteRoute),
    Project(ProjectRoute),
}

/// A site served purely by Caddy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRoute {
    pub domain: String,
    pub kind: SiteKind,
    pub target: String,
    pub tls: bool,
}

/// A supervised project reverse-proxied by Caddy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoute {
    /// Raw domain lines, validated during rendering
    pub domains: Vec<String>,
    pub upstream_host: &'static str,
    pub port: u16,
    pub path: String,
    /// Raw "Name: value" header lines
    pub headers: Vec<String>,
    pub tls: bool,
    pub tls_email: String,
}

impl From<&SiteRecord> for Routable {
    fn from(site: &SiteRecord) -> Self {
        Routable::Site(SiteRoute {
            domain: site.domain.trim().to_string(),
            kind: site.site_type,
            target: site.target.trim().to_string(),
            tls: site.ssl_enabled,
        })
    }
}

impl From<&ProjectRecord> for Routable {
    fn from(project: &ProjectRecord) -> Self {
        Routable::Project(ProjectRoute {
            domains: project.domains.lines().map(|l| l.trim().to_string()).collect(),
            upstream_host: if project.use_ipv4 { "127.0.0.1" } else { "localhost" },
            port: project.port,
            path: project.reverse_proxy_path.trim().to_string(),
            headers: project
                .extra_headers
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            tls: project.ssl_enabled,
            tls_email: project.ssl_email.trim().to_string(),
        })
    }
}

/// Collect every row in store order: sites first, then projects
pub fn routables(sites: &[SiteRecord], projects: &[ProjectRecord]) -> Vec<Routable> {
    sites
        .iter()
        .map(Routable::from)
        .chain(projects.iter().map(Routable::from))
        .collect()
}

/// Renders Caddyfile text
#[derive(Debug, Clone)]
pub struct Renderer {
    php_fastcgi: String,
}

impl Renderer {
    pub fn new(php_fastcgi: impl Into<String>) -> Self {
        Self {
            php_fastcgi: php_fastcgi.into(),
        }
    }

    /// Render all routables into a complete Caddyfile
    ///
    /// Invalid domains are skipped silently. When nothing yields a block the
    /// output is a single `:80` acknowledgement block so Caddy always has a
    /// valid server.
    pub fn render(&self, routes: &[Routable]) -> String {
        let mut out = String::from(HEADER);
        let mut blocks = 0;

        for route in routes {
            match route {
                Routable::Site(site) => {
                    let domain = site.domain.trim();
                    if !is_valid_domain(domain) {
                        continue;
                    }
                    let directives = self.site_directives(site);
                    push_block(&mut out, &site_address(domain, site.tls), &directives);
                    blocks += 1;
                }
                Routable::Project(project) => {
                    let directives = project_directives(project);
                    let domains = project.domains.iter().map(|d| d.trim()).filter(|d| is_valid_domain(d));
                    for domain in domains {
                        push_block(&mut out, &site_address(domain, project.tls), &directives);
                        blocks += 1;
                    }
                }
            }
        }

        if blocks == 0 {
            out.push_str(DEFAULT_BLOCK);
        }

        out
    }

    fn site_directives(&self, site: &SiteRoute) -> Vec<String> {
        let target = quote_arg(&site.target);
        match site.kind {
            SiteKind::Proxy => vec![format!("reverse_proxy {}", target)],
            SiteKind::Static => vec![format!("root * {}", target), "file_server".to_string()],
            SiteKind::Php => vec![
                format!("root * {}", target),
                format!("php_fastcgi {}", self.php_fastcgi),
                "file_server".to_string(),
            ],
        }
    }
}

fn project_directives(project: &ProjectRoute) -> Vec<String> {
    let mut directives = Vec::new();

    if project.tls && !project.tls_email.is_empty() {
        directives.push(format!("tls {}", quote_arg(&project.tls_email)));
    }

    let upstream = format!("{}:{}", project.upstream_host, project.port);
    let proxy = match path_matcher(&project.path) {
        Some(matcher) => format!("reverse_proxy {} {}", quote_arg(&matcher), upstream),
        None => format!("reverse_proxy {}", upstream),
    };

    let headers: Vec<String> = project.headers.iter().filter_map(|h| header_directive(h)).collect();
    if headers.is_empty() {
        directives.push(proxy);
    } else {
        directives.push(format!("{} {{", proxy));
        for header in headers {
            directives.push(format!("{}{}", INDENT, header));
        }
        directives.push("}".to_string());
    }

    directives
}

fn push_block(out: &mut String, address: &str, directives: &[String]) {
    out.push_str(address);
    out.push_str(" {\n");
    for directive in directives {
        out.push_str(INDENT);
        out.push_str(directive);
        out.push('\n');
    }
    out.push_str("}\n\n");
}

/// Plain-HTTP addresses keep Caddy from provisioning certificates
fn site_address(domain: &str, tls: bool) -> String {
    if tls {
        domain.to_string()
    } else {
        format!("http://{}", domain)
    }
}

/// Path matcher for a sub-path mount; `/` and empty mean everything
fn path_matcher(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() || path == "/" || path == "*" || path == "/*" {
        return None;
    }

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    if path.ends_with('*') {
        Some(path)
    } else if path.ends_with('/') {
        Some(format!("{}*", path))
    } else {
        Some(format!("{}/*", path))
    }
}

/// Turn a "Name: value", "Name value" or "-Name" line into a `header_up`
/// subdirective. Lines without a valid header name are dropped.
fn header_directive(line: &str) -> Option<String> {
    let line = line.trim();

    if let Some(removed) = line.strip_prefix('-') {
        return is_header_name(removed).then(|| format!("header_up -{}", removed));
    }

    let (name, value) = match line.split_once(':') {
        Some((name, value)) if is_header_name(name.trim()) => (name.trim(), value.trim()),
        _ => {
            let (name, value) = line.split_once(char::is_whitespace)?;
            (name, value.trim())
        }
    };
    if !is_header_name(name) || value.is_empty() {
        return None;
    }

    Some(format!("header_up {} {}", name, quote_arg(value)))
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Emit `arg` as one Caddyfile token, quoting it unless it is plain text
/// with only well-formed `{placeholder}` braces
fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && !arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '#')
        && braces_are_placeholders(arg);
    if plain {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

fn braces_are_placeholders(arg: &str) -> bool {
    let mut open = false;
    for c in arg.chars() {
        match c {
            '{' if open => return false,
            '{' => open = true,
            '}' if !open => return false,
            '}' => open = false,
            _ => {}
        }
    }
    !open
}

/// Check a domain line against the accepted host grammar
///
/// An optional trailing `:port` is ignored. The host must be 1-253
/// characters without whitespace, made of dot-separated labels of 1-63
/// ASCII letters, digits, `-` or `_` that neither start nor end with `-`.
/// A single label is only accepted for `localhost`.
pub fn is_valid_domain(domain: &str) -> bool {
    let host = strip_port(domain);

    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.chars().any(char::is_whitespace) {
        return false;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() == 1 {
        return host == "localhost";
    }

    labels.iter().all(|label| is_valid_label(label))
}

fn strip_port(domain: &str) -> &str {
    match domain.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => domain,
    }
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Replace the file at `path` with `contents`
///
/// The text is written to a sibling temp file and renamed over the target,
/// so readers never observe a partial Caddyfile.
pub fn write_config(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
