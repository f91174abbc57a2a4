use caddy_manager::api::ApiServer;
use caddy_manager::caddyfile::Renderer;
use caddy_manager::config::Config;
use caddy_manager::db::Database;
use caddy_manager::panel::Panel;
use caddy_manager::process::ProcessSupervisor;
use caddy_manager::proxy::{CaddyController, ProxyControl};
use caddy_manager::reconcile::Reconciler;
use caddy_manager::{diagnostics, install, PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caddy_manager=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("caddy-manager.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    let bind_addr = config.bind_addr()?;

    print_startup_banner(&config);

    std::fs::create_dir_all(config.data_dir())?;
    std::fs::create_dir_all(config.caddy_dir())?;
    std::fs::create_dir_all(config.project_log_dir())?;

    let db = Arc::new(Database::open(config.database_path())?);
    info!(path = %config.database_path().display(), "Database initialized");

    if !diagnostics::is_elevated() {
        warn!("Not running with administrator privileges; Caddy may fail to bind ports 80 and 443");
    }

    let binary = config.caddy_binary();
    if config.caddy.auto_install {
        match install::ensure_installed(&binary, config.caddy.download_url.as_deref()).await {
            Ok(true) => info!(path = %binary.display(), "Caddy downloaded"),
            Ok(false) => {}
            Err(e) => error!(
                error = %e,
                path = %binary.display(),
                "Caddy installation failed; place the binary there manually to enable proxy control"
            ),
        }
    } else if !binary.is_file() {
        warn!(path = %binary.display(), "Caddy binary not found and auto_install is disabled");
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let supervisor = ProcessSupervisor::new(Arc::clone(&db), config.project_log_dir());
    let proxy: Arc<dyn ProxyControl> = Arc::new(CaddyController::new(
        &binary,
        config.caddyfile_path(),
        config.caddy_log_path(),
        config.restart_settle_delay(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&db),
        Renderer::new(config.caddy.php_fastcgi.clone()),
        config.caddyfile_path(),
        Arc::clone(&proxy),
        Arc::clone(&supervisor),
    ));
    let panel = Arc::new(Panel::new(
        Arc::clone(&db),
        Arc::clone(&supervisor),
        Arc::clone(&proxy),
        Arc::clone(&reconciler),
        config.default_www_root(),
    ));

    panel.init_defaults()?;
    if panel.is_first_run()? {
        info!("No users configured yet (first run)");
    }

    if config.caddy.auto_start {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            let report = reconciler.startup().await;
            for warning in &report.warnings {
                warn!(warning = %warning, "Startup");
            }
        });
    } else if let Err(e) = reconciler.publish().await {
        warn!(error = %e, "Failed to write initial Caddyfile");
    }

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure admin_token to set a fixed value)");
        token
    });

    let api_server = ApiServer::new(bind_addr, admin_token, Arc::clone(&panel), Arc::clone(&shutdown_tx));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = shutdown_rx.changed() => {
                info!("Shutdown requested, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = shutdown_rx.changed() => {
                info!("Shutdown requested, shutting down...");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    panel.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control panel");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        data_dir = %config.data_dir().display(),
        "Server configuration"
    );
    info!(
        binary = %config.caddy_binary().display(),
        caddyfile = %config.caddyfile_path().display(),
        auto_install = config.caddy.auto_install,
        auto_start = config.caddy.auto_start,
        restart_settle_ms = config.caddy.restart_settle_ms,
        "Caddy settings"
    );
}
