//! Caddy Manager - a local control panel for a Caddy reverse proxy
//!
//! This library provides:
//! - A SQLite store of sites, projects, tasks and settings
//! - Supervision of user-defined project processes with per-project logs
//! - Caddyfile rendering from the stored sites and projects
//! - Lifecycle control of a single Caddy instance, including installation
//! - Reconciliation of Caddy's routing after every routing-affecting change
//! - Port, privilege and firewall diagnostics with remediation hints

pub mod api;
pub mod caddyfile;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod install;
pub mod logs;
pub mod panel;
pub mod process;
pub mod proxy;
pub mod reconcile;
pub mod tasks;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
