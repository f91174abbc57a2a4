//! Control panel configuration
//!
//! Loaded from a TOML file. Every field has a default, so a missing file
//! yields a working configuration rooted at the platform data directory.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the Caddy executable inside the install directory
#[cfg(windows)]
pub const CADDY_BINARY_NAME: &str = "caddy.exe";
#[cfg(not(windows))]
pub const CADDY_BINARY_NAME: &str = "caddy";

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Control panel HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// On-disk locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Caddy binary management
    #[serde(default)]
    pub caddy: CaddyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control panel port (default: 8989)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bearer token for the API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    /// Root for the database, Caddy install, Caddyfile and logs
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaddyConfig {
    /// Explicit path to a Caddy binary (skips the managed install location)
    pub binary: Option<String>,

    /// Release archive to download when the binary is missing
    pub download_url: Option<String>,

    /// Download the binary at startup when it is missing (default: true)
    #[serde(default = "default_true")]
    pub auto_install: bool,

    /// Start Caddy and auto-start projects at startup (default: true)
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Delay between stop and start during a restart, in milliseconds (default: 1000)
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,

    /// FastCGI upstream for php sites (default: localhost:9000)
    #[serde(default = "default_php_fastcgi")]
    pub php_fastcgi: String,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            binary: None,
            download_url: None,
            auto_install: true,
            auto_start: true,
            restart_settle_ms: default_restart_settle_ms(),
            php_fastcgi: default_php_fastcgi(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8989
}

fn default_true() -> bool {
    true
}

fn default_restart_settle_ms() -> u64 {
    1000
}

fn default_php_fastcgi() -> String {
    "localhost:9000".to_string()
}

impl Config {
    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("server.bind '{}' is not an IP address", self.server.bind));
        }
        if matches!(self.server.admin_token.as_deref(), Some(t) if t.trim().is_empty()) {
            errors.push("server.admin_token must not be empty when set".to_string());
        }
        if self.caddy.php_fastcgi.trim().is_empty() {
            errors.push("caddy.php_fastcgi must not be empty".to_string());
        }
        if self.caddy.restart_settle_ms > 60_000 {
            errors.push("caddy.restart_settle_ms must be at most 60000".to_string());
        }
        if let Some(ref url) = self.caddy.download_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                errors.push(format!("caddy.download_url '{}' must be an http(s) URL", url));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Socket address of the control panel
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.server.bind, e))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.paths.data_dir {
            Some(ref dir) => PathBuf::from(dir),
            None => dirs_next::data_local_dir()
                .map(|d| d.join("caddy-manager"))
                .unwrap_or_else(|| PathBuf::from("./data")),
        }
    }

    /// Directory holding the Caddy binary, Caddyfile and Caddy log
    pub fn caddy_dir(&self) -> PathBuf {
        self.data_dir().join("caddy")
    }

    pub fn caddy_binary(&self) -> PathBuf {
        match self.caddy.binary {
            Some(ref bin) => PathBuf::from(bin),
            None => self.caddy_dir().join(CADDY_BINARY_NAME),
        }
    }

    pub fn caddyfile_path(&self) -> PathBuf {
        self.caddy_dir().join("Caddyfile")
    }

    pub fn caddy_log_path(&self) -> PathBuf {
        self.caddy_dir().join("caddy.log")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("caddy-manager.db")
    }

    /// Directory for per-project process logs
    pub fn project_log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn default_www_root(&self) -> PathBuf {
        self.data_dir().join("www")
    }

    pub fn restart_settle_delay(&self) -> Duration {
        Duration::from_millis(self.caddy.restart_settle_ms)
    }
}
