//! SQLite database for managed projects, sites, tasks, settings and users
//!
//! Rows are the declarative source of truth; the Caddyfile and the
//! supervisor's process table are derived from them.

use crate::process::{ProjectStatus, RuntimeKind};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A user-defined process fronted by Caddy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub project_type: RuntimeKind,
    pub root_dir: String,
    pub exec_path: String,
    pub start_command: String,
    pub port: u16,
    pub auto_start: bool,
    /// Newline-separated domain list
    pub domains: String,
    pub ssl_enabled: bool,
    pub ssl_email: String,
    pub reverse_proxy_path: String,
    /// Newline-separated "Name: value" lines
    pub extra_headers: String,
    pub description: String,
    /// Proxy to 127.0.0.1 instead of localhost
    pub use_ipv4: bool,
    /// Last observed process state
    pub status: ProjectStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when creating or updating a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInput {
    pub name: String,
    #[serde(default)]
    pub project_type: RuntimeKind,
    #[serde(default)]
    pub root_dir: String,
    #[serde(default)]
    pub exec_path: String,
    #[serde(default)]
    pub start_command: String,
    pub port: u16,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub domains: String,
    #[serde(default = "default_true")]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub ssl_email: String,
    #[serde(default = "default_proxy_path")]
    pub reverse_proxy_path: String,
    #[serde(default)]
    pub extra_headers: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub use_ipv4: bool,
}

fn default_true() -> bool {
    true
}

fn default_proxy_path() -> String {
    "/".to_string()
}

/// How a site is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteKind {
    /// Reverse proxy to an upstream address
    Proxy,
    /// File server rooted at a directory
    Static,
    /// File server plus PHP FastCGI
    Php,
}

impl SiteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteKind::Proxy => "proxy",
            SiteKind::Static => "static",
            SiteKind::Php => "php",
        }
    }

    /// Parse a stored kind; unknown values are served as proxies
    pub fn from_name(name: &str) -> Self {
        match name {
            "static" => SiteKind::Static,
            "php" => SiteKind::Php,
            _ => SiteKind::Proxy,
        }
    }
}

/// A site handled entirely by generated configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub id: i64,
    pub domain: String,
    pub site_type: SiteKind,
    /// Upstream address or filesystem path
    pub target: String,
    pub ssl_enabled: bool,
    pub php_version: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteInput {
    pub domain: String,
    pub site_type: SiteKind,
    pub target: String,
    #[serde(default = "default_true")]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub php_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub is_loop: bool,
    pub status: String,
    pub last_run: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub is_loop: bool,
}

const PROJECT_COLUMNS: &str = "id, name, project_type, root_dir, exec_path, start_command, port,
    auto_start, domains, ssl_enabled, ssl_email, reverse_proxy_path, extra_headers,
    description, use_ipv4, status, created_at, updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectRecord> {
    let project_type: String = row.get(2)?;
    let port: i64 = row.get(6)?;
    let status: String = row.get(15)?;
    Ok(ProjectRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        project_type: RuntimeKind::from_name(&project_type),
        root_dir: row.get(3)?,
        exec_path: row.get(4)?,
        start_command: row.get(5)?,
        port: u16::try_from(port).unwrap_or(0),
        auto_start: row.get(7)?,
        domains: row.get(8)?,
        ssl_enabled: row.get(9)?,
        ssl_email: row.get(10)?,
        reverse_proxy_path: row.get(11)?,
        extra_headers: row.get(12)?,
        description: row.get(13)?,
        use_ipv4: row.get(14)?,
        status: ProjectStatus::from_name(&status),
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

const SITE_COLUMNS: &str = "id, domain, site_type, target, ssl_enabled, php_version, created_at";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<SiteRecord> {
    let site_type: String = row.get(2)?;
    Ok(SiteRecord {
        id: row.get(0)?,
        domain: row.get(1)?,
        site_type: SiteKind::from_name(&site_type),
        target: row.get(3)?,
        ssl_enabled: row.get(4)?,
        php_version: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const TASK_COLUMNS: &str = "id, name, command, schedule, is_loop, status, last_run, created_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        schedule: row.get(3)?,
        is_loop: row.get(4)?,
        status: row.get(5)?,
        last_run: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .context("Failed to open database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: projects, sites, settings, users
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                project_type TEXT NOT NULL DEFAULT 'command',
                root_dir TEXT NOT NULL DEFAULT '',
                exec_path TEXT NOT NULL DEFAULT '',
                start_command TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL,
                auto_start INTEGER NOT NULL DEFAULT 0,
                domains TEXT NOT NULL DEFAULT '',
                ssl_enabled INTEGER NOT NULL DEFAULT 1,
                ssl_email TEXT NOT NULL DEFAULT '',
                reverse_proxy_path TEXT NOT NULL DEFAULT '/',
                extra_headers TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                use_ipv4 INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL,
                site_type TEXT NOT NULL DEFAULT 'proxy',
                target TEXT NOT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 1,
                php_version TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT OR IGNORE INTO settings (key, value) VALUES ('security_path', '');

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: on-demand tasks
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: tasks");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                schedule TEXT NOT NULL DEFAULT '',
                is_loop INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'waiting',
                last_run TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    // ==================== Projects ====================

    pub fn create_project(&self, input: &ProjectInput) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (name, project_type, root_dir, exec_path, start_command, port,
                auto_start, domains, ssl_enabled, ssl_email, reverse_proxy_path, extra_headers,
                description, use_ipv4)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                input.name,
                input.project_type.as_str(),
                input.root_dir,
                input.exec_path,
                input.start_command,
                input.port,
                input.auto_start,
                input.domains,
                input.ssl_enabled,
                input.ssl_email,
                input.reverse_proxy_path,
                input.extra_headers,
                input.description,
                input.use_ipv4,
            ],
        )
        .context("Failed to create project")?;

        let id = conn.last_insert_rowid();
        debug!(project_id = id, name = %input.name, "Created project record");
        Ok(id)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
            params![id],
            project_from_row,
        )
        .optional()
        .context("Failed to get project")
    }

    /// All projects in ascending id order
    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS))?;

        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(projects)
    }

    /// Replace every editable field; returns false when the project does not exist
    pub fn update_project(&self, id: i64, input: &ProjectInput) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE projects SET name = ?1, project_type = ?2, root_dir = ?3, exec_path = ?4,
                    start_command = ?5, port = ?6, auto_start = ?7, domains = ?8, ssl_enabled = ?9,
                    ssl_email = ?10, reverse_proxy_path = ?11, extra_headers = ?12,
                    description = ?13, use_ipv4 = ?14, updated_at = datetime('now')
                 WHERE id = ?15",
                params![
                    input.name,
                    input.project_type.as_str(),
                    input.root_dir,
                    input.exec_path,
                    input.start_command,
                    input.port,
                    input.auto_start,
                    input.domains,
                    input.ssl_enabled,
                    input.ssl_email,
                    input.reverse_proxy_path,
                    input.extra_headers,
                    input.description,
                    input.use_ipv4,
                    id,
                ],
            )
            .context("Failed to update project")?;
        Ok(updated > 0)
    }

    pub fn update_project_status(&self, id: i64, status: ProjectStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE projects SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .context("Failed to update project status")?;
        Ok(())
    }

    /// Returns false when the project did not exist
    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(deleted > 0)
    }

    // ==================== Sites ====================

    pub fn create_site(&self, input: &SiteInput) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sites (domain, site_type, target, ssl_enabled, php_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                input.domain,
                input.site_type.as_str(),
                input.target,
                input.ssl_enabled,
                input.php_version,
            ],
        )
        .context("Failed to create site")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_site(&self, id: i64) -> Result<Option<SiteRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS),
            params![id],
            site_from_row,
        )
        .optional()
        .context("Failed to get site")
    }

    /// All sites in ascending id order
    pub fn list_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM sites ORDER BY id", SITE_COLUMNS))?;

        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    pub fn update_site(&self, id: i64, input: &SiteInput) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE sites SET domain = ?1, site_type = ?2, target = ?3, ssl_enabled = ?4,
                    php_version = ?5
                 WHERE id = ?6",
                params![
                    input.domain,
                    input.site_type.as_str(),
                    input.target,
                    input.ssl_enabled,
                    input.php_version,
                    id,
                ],
            )
            .context("Failed to update site")?;
        Ok(updated > 0)
    }

    pub fn delete_site(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM sites WHERE id = ?1", params![id])
            .context("Failed to delete site")?;
        Ok(deleted > 0)
    }

    // ==================== Tasks ====================

    pub fn create_task(&self, input: &TaskInput) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (name, command, schedule, is_loop) VALUES (?1, ?2, ?3, ?4)",
            params![input.name, input.command, input.schedule, input.is_loop],
        )
        .context("Failed to create task")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            task_from_row,
        )
        .optional()
        .context("Failed to get task")
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY id", TASK_COLUMNS))?;

        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tasks)
    }

    /// Record a run: status plus the current time as last_run
    pub fn set_task_run(&self, id: i64, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET status = ?1, last_run = datetime('now') WHERE id = ?2",
            params![status, id],
        )
        .context("Failed to record task run")?;
        Ok(())
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(deleted > 0)
    }

    // ==================== Settings ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("Failed to set setting")?;
        Ok(())
    }

    /// Insert a setting only if it is not present yet
    pub fn init_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .context("Failed to initialize setting")?;
        Ok(())
    }

    pub fn all_settings(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;

        let settings = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(settings)
    }

    // ==================== Users ====================

    /// Store a user; the hash is opaque to this layer
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, password_hash],
        )
        .context("Failed to create user")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_password_hash(&self, username: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT password_hash FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get user")
    }

    pub fn user_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }
}
