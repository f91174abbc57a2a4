//! Panel operations against a recording proxy

mod common;

use caddy_manager::db::{SiteInput, SiteKind, TaskInput};
use caddy_manager::error::ApiErrorCode;
use caddy_manager::panel::{PanelError, DEFAULT_LOG_LINES, SETTING_SECURITY_PATH, SETTING_WWW_ROOT};
use caddy_manager::process::ProjectStatus;
use common::{free_port, project_input, Harness, RecordingProxy};
use std::collections::BTreeMap;

fn harness() -> Harness {
    Harness::with_proxy(RecordingProxy::running())
}

#[tokio::test]
async fn test_add_project_reconciles_and_warns_on_bad_domains() {
    let h = harness();
    let mut input = project_input("api", free_port(), "");
    input.domains = "api.example.com\nnot a domain\n".to_string();

    let added = h.panel.add_project(input).await.unwrap();

    assert_eq!(added.record.name, "api");
    assert_eq!(added.reconcile.warnings.len(), 1);
    assert!(added.reconcile.warnings[0].contains("not a domain"));
    assert_eq!(h.proxy.calls(), vec!["reload"]);
    assert!(h.caddyfile().contains("api.example.com {"));
}

#[tokio::test]
async fn test_add_project_rejects_bad_input() {
    let h = harness();

    let err = h.panel.add_project(project_input("  ", 8080, "")).await.unwrap_err();
    assert_eq!(err.api_code(), ApiErrorCode::BadRequest);

    let err = h.panel.add_project(project_input("web", 0, "")).await.unwrap_err();
    assert_eq!(err.api_code(), ApiErrorCode::BadRequest);
    assert!(h.proxy.calls().is_empty());
}

#[tokio::test]
async fn test_missing_project_is_not_found() {
    let h = harness();

    for err in [
        h.panel.get_project(5).await.unwrap_err(),
        h.panel.start_project(5).await.unwrap_err(),
        h.panel.stop_project(5).await.unwrap_err(),
        h.panel.project_status(5).await.unwrap_err(),
        h.panel.delete_project(5).await.unwrap_err(),
        h.panel.update_project(5, project_input("x", 1, "")).await.unwrap_err(),
    ] {
        assert_eq!(err.api_code(), ApiErrorCode::NotFound, "{}", err);
    }
}

#[tokio::test]
async fn test_start_rejects_invalid_configuration() {
    let h = harness();
    let added = h.panel.add_project(project_input("web", free_port(), "")).await.unwrap();

    let err = h.panel.start_project(added.record.id).await.unwrap_err();
    match err {
        PanelError::Start { error, log_path } => {
            assert_eq!(error.code(), "CONFIG_ERROR");
            assert!(log_path.ends_with(&format!("project_{}.log", added.record.id)));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_start_reports_port_owner() {
    let h = harness();
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut input = project_input("web", port, "sleep 30");
    input.root_dir = h.root_dir();
    let added = h.panel.add_project(input).await.unwrap();

    let err = h.panel.start_project(added.record.id).await.unwrap_err();
    match err {
        PanelError::Start { error, .. } => assert_eq!(error.code(), "PORT_IN_USE"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!h.supervisor.is_tracked(added.record.id).await);
}

#[tokio::test]
async fn test_delete_project_reconciles() {
    let h = harness();
    let mut input = project_input("web", free_port(), "");
    input.domains = "web.example.com".to_string();
    let added = h.panel.add_project(input).await.unwrap();

    let report = h.panel.delete_project(added.record.id).await.unwrap();
    assert!(report.config_written);
    assert!(h.db.get_project(added.record.id).unwrap().is_none());
    assert!(!h.caddyfile().contains("web.example.com"));
}

#[tokio::test]
async fn test_list_resyncs_stale_status() {
    let h = harness();
    let added = h.panel.add_project(project_input("web", free_port(), "")).await.unwrap();
    h.db
        .update_project_status(added.record.id, ProjectStatus::Running)
        .unwrap();

    let projects = h.panel.list_projects().await.unwrap();
    assert_eq!(projects[0].status, ProjectStatus::Stopped);
    assert_eq!(
        h.db.get_project(added.record.id).unwrap().unwrap().status,
        ProjectStatus::Stopped
    );
}

#[tokio::test]
async fn test_project_logs_placeholder() {
    let h = harness();
    let added = h.panel.add_project(project_input("web", free_port(), "")).await.unwrap();

    let lines = h.panel.project_logs(added.record.id, DEFAULT_LOG_LINES).unwrap();
    assert_eq!(lines, vec!["No logs yet"]);
}

#[tokio::test]
async fn test_site_crud_validates_domain() {
    let h = harness();
    let input = SiteInput {
        domain: "bad domain".to_string(),
        site_type: SiteKind::Static,
        target: "/srv/www".to_string(),
        ssl_enabled: false,
        php_version: String::new(),
    };
    assert!(matches!(h.panel.add_site(input.clone()).await, Err(PanelError::Invalid(_))));

    let added = h
        .panel
        .add_site(SiteInput {
            domain: "static.example.com".to_string(),
            ..input
        })
        .await
        .unwrap();
    assert_eq!(h.panel.list_sites().unwrap().len(), 1);

    h.panel.delete_site(added.record.id).await.unwrap();
    assert!(matches!(
        h.panel.delete_site(added.record.id).await,
        Err(PanelError::NotFound { .. })
    ));
}

#[test]
fn test_settings_only_accept_known_keys() {
    let h = harness();
    h.panel.init_defaults().unwrap();
    assert!(h.tmp.path().join("www").is_dir());

    let mut updates = BTreeMap::new();
    updates.insert("admin_password".to_string(), "x".to_string());
    assert!(matches!(h.panel.update_settings(updates), Err(PanelError::Invalid(_))));

    let new_root = h.tmp.path().join("public");
    let mut updates = BTreeMap::new();
    updates.insert(SETTING_WWW_ROOT.to_string(), new_root.to_string_lossy().to_string());
    updates.insert(SETTING_SECURITY_PATH.to_string(), "/secret".to_string());
    let settings = h.panel.update_settings(updates).unwrap();

    assert!(new_root.is_dir());
    assert_eq!(settings.get(SETTING_SECURITY_PATH).map(String::as_str), Some("/secret"));
}

#[tokio::test]
async fn test_run_task_records_outcome() {
    let h = harness();
    let task = h
        .panel
        .add_task(TaskInput {
            name: "hello".to_string(),
            command: "echo hi".to_string(),
            schedule: String::new(),
            is_loop: false,
        })
        .unwrap();

    let run = h.panel.run_task(task.id).await.unwrap();
    assert!(run.outcome.success);
    assert_eq!(run.task.status, "success");
    assert!(run.task.last_run.is_some());
}

#[tokio::test]
async fn test_proxy_stop_requires_running() {
    let h = harness();
    h.panel.proxy_stop().await.unwrap();

    let err = h.panel.proxy_stop().await.unwrap_err();
    assert_eq!(err.api_code(), ApiErrorCode::ProxyNotRunning);
    match err {
        PanelError::Proxy { suggestions, .. } => assert_eq!(suggestions, vec!["Start Caddy first"]),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_failed_reload_is_annotated() {
    let proxy = RecordingProxy::running();
    *proxy.fail_reload.lock() = true;
    let h = Harness::with_proxy(proxy);

    let err = h.panel.proxy_reload().await.unwrap_err();
    assert_eq!(err.api_code(), ApiErrorCode::ProxyError);
    match err {
        PanelError::Proxy { suggestions, .. } => {
            assert_eq!(suggestions.last().map(String::as_str), Some("Check the Caddy log for details"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_check_ssl_rejects_invalid_domain() {
    let h = harness();
    let err = h.panel.check_ssl("no spaces allowed.com").await.unwrap_err();
    assert_eq!(err.api_code(), ApiErrorCode::BadRequest);
}
