//! Process supervision and reconciliation against real child processes

#![cfg(unix)]

mod common;

use caddy_manager::process::{LaunchSpec, ProjectStatus, RuntimeKind};
use common::{project_input, wait_until, Harness};
use std::time::Duration;

fn command(start_command: &str, root_dir: &str) -> LaunchSpec {
    LaunchSpec {
        runtime: RuntimeKind::Command,
        root_dir: root_dir.to_string(),
        exec_path: String::new(),
        start_command: start_command.to_string(),
        port: 0,
    }
}

fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn stored_status(h: &Harness, id: i64) -> ProjectStatus {
    h.db.get_project(id).unwrap().unwrap().status
}

#[tokio::test]
async fn test_start_then_stop() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("sleeper", 18080, "sleep 30")).unwrap();

    let pid = h.supervisor.start(id, &command("sleep 30", &h.root_dir())).await.unwrap();
    assert!(pid > 0);
    assert!(h.supervisor.is_tracked(id).await);
    assert_eq!(h.supervisor.pid(id).await, Some(pid));
    assert_eq!(h.supervisor.status(id, 0).await, ProjectStatus::Running);
    assert_eq!(stored_status(&h, id), ProjectStatus::Running);

    h.supervisor.stop(id).await.unwrap();

    assert_eq!(h.supervisor.status(id, 0).await, ProjectStatus::Stopped);
    assert_eq!(stored_status(&h, id), ProjectStatus::Stopped);
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn test_second_start_replaces_first_process() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("sleeper", 18081, "sleep 30")).unwrap();
    let spec = command("sleep 30", &h.root_dir());

    let first = h.supervisor.start(id, &spec).await.unwrap();
    let second = h.supervisor.start(id, &spec).await.unwrap();

    assert_ne!(first, second);
    assert!(!pid_alive(first));
    assert!(pid_alive(second));
    assert_eq!(h.supervisor.tracked_ids().await, vec![id]);

    // the replaced process's exit must not clear the new handle
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.supervisor.is_tracked(id).await);
    assert_eq!(stored_status(&h, id), ProjectStatus::Running);

    h.supervisor.stop(id).await.unwrap();
}

#[tokio::test]
async fn test_natural_exit_clears_handle() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("oneshot", 18082, "")).unwrap();

    h.supervisor
        .start(id, &command("sh -c 'sleep 0.2'", &h.root_dir()))
        .await
        .unwrap();

    let supervisor = h.supervisor.clone();
    assert!(wait_until(Duration::from_secs(5), || {
        let supervisor = supervisor.clone();
        async move { !supervisor.is_tracked(id).await }
    })
    .await);
    assert_eq!(stored_status(&h, id), ProjectStatus::Stopped);

    // stopping an already exited project is a no-op
    h.supervisor.stop(id).await.unwrap();
}

#[tokio::test]
async fn test_stop_all() {
    let h = Harness::new();
    let a = h.db.create_project(&project_input("a", 18083, "sleep 30")).unwrap();
    let b = h.db.create_project(&project_input("b", 18084, "sleep 30")).unwrap();

    let pid_a = h.supervisor.start(a, &command("sleep 30", &h.root_dir())).await.unwrap();
    let pid_b = h.supervisor.start(b, &command("sleep 30", &h.root_dir())).await.unwrap();

    h.supervisor.stop_all().await;

    assert!(h.supervisor.tracked_ids().await.is_empty());
    assert!(!pid_alive(pid_a));
    assert!(!pid_alive(pid_b));
    assert_eq!(stored_status(&h, a), ProjectStatus::Stopped);
    assert_eq!(stored_status(&h, b), ProjectStatus::Stopped);
}

#[tokio::test]
async fn test_status_falls_back_to_listening_port() {
    let h = Harness::new();
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert_eq!(h.supervisor.status(77, port).await, ProjectStatus::Running);
    drop(listener);
    assert_eq!(h.supervisor.status(77, port).await, ProjectStatus::Stopped);
}

#[tokio::test]
async fn test_output_goes_to_project_log() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("echo", 18085, "")).unwrap();

    h.supervisor
        .start(id, &command("sh -c 'echo hello-from-project; echo oops >&2'", &h.root_dir()))
        .await
        .unwrap();

    let supervisor = h.supervisor.clone();
    assert!(wait_until(Duration::from_secs(5), || {
        let supervisor = supervisor.clone();
        async move { !supervisor.is_tracked(id).await }
    })
    .await);

    let lines = h.supervisor.logs(id, 10).unwrap();
    assert!(lines.iter().any(|l| l.contains("starting: sh")));
    assert!(lines.iter().any(|l| l == "hello-from-project"));
    assert!(lines.iter().any(|l| l == "oops"));
}

#[tokio::test]
async fn test_port_env_is_set() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("env", 18086, "")).unwrap();
    let mut spec = command("sh -c 'echo port=$PORT'", &h.root_dir());
    spec.port = 18086;

    h.supervisor.start(id, &spec).await.unwrap();

    let supervisor = h.supervisor.clone();
    assert!(wait_until(Duration::from_secs(5), || {
        let supervisor = supervisor.clone();
        async move { !supervisor.is_tracked(id).await }
    })
    .await);

    let lines = h.supervisor.logs(id, 5).unwrap();
    assert!(lines.iter().any(|l| l == "port=18086"), "{:?}", lines);
}

#[tokio::test]
async fn test_add_auto_start_project_reconciles_in_order() {
    let h = Harness::new();
    h.proxy_start().await;

    let mut input = project_input("web", 8080, "sleep 30");
    input.root_dir = h.root_dir();
    input.domains = "example.com".to_string();
    input.auto_start = true;

    let added = h.panel.add_project(input).await.unwrap();
    let id = added.record.id;

    // routing block for the new project
    let caddyfile = h.caddyfile();
    assert!(caddyfile.contains("example.com {"), "{}", caddyfile);
    assert!(caddyfile.contains("reverse_proxy 127.0.0.1:8080"), "{}", caddyfile);

    // proxy told to pick it up
    assert_eq!(h.proxy.calls(), vec!["start", "reload"]);
    assert!(added.reconcile.config_written);

    // project process live under the new id
    assert!(h.supervisor.is_tracked(id).await);
    assert_eq!(added.reconcile.started.len(), 1);
    assert!(added.reconcile.warnings.is_empty(), "{:?}", added.reconcile.warnings);

    h.panel.delete_project(id).await.unwrap();
    assert!(!h.supervisor.is_tracked(id).await);
    assert!(!h.caddyfile().contains("example.com"));
}

#[tokio::test]
async fn test_startup_starts_auto_start_projects() {
    let h = Harness::new();

    let mut input = project_input("boot", 18087, "sleep 30");
    input.root_dir = h.root_dir();
    input.auto_start = true;
    let auto = h.db.create_project(&input).unwrap();
    let manual = h.db.create_project(&project_input("manual", 18088, "sleep 30")).unwrap();

    let report = h.reconciler.startup().await;

    assert!(report.config_written);
    assert_eq!(h.proxy.calls(), vec!["start"]);
    assert!(h.supervisor.is_tracked(auto).await);
    assert!(!h.supervisor.is_tracked(manual).await);

    h.panel.shutdown().await;
    assert!(!h.supervisor.is_tracked(auto).await);
    assert_eq!(h.proxy.calls(), vec!["start", "stop"]);
}

#[tokio::test]
async fn test_panel_start_and_restart() {
    let h = Harness::new();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut input = project_input("svc", port, "sleep 30");
    input.root_dir = h.root_dir();
    let id = h.panel.add_project(input).await.unwrap().record.id;

    let started = h.panel.start_project(id).await.unwrap();
    assert_eq!(h.panel.project_status(id).await.unwrap().status, ProjectStatus::Running);

    let restarted = h.panel.restart_project(id).await.unwrap();
    assert_ne!(started.pid, restarted.pid);
    assert!(!pid_alive(started.pid));

    h.panel.stop_project(id).await.unwrap();
    assert_eq!(h.panel.project_status(id).await.unwrap().status, ProjectStatus::Stopped);
}

#[tokio::test]
async fn test_stop_racing_natural_exit() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("brief", 18089, "")).unwrap();
    let spec = command("sh -c 'sleep 0.1'", &h.root_dir());

    for delay_ms in [0u64, 50, 100, 150] {
        h.supervisor.start(id, &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        h.supervisor.stop(id).await.unwrap();
        assert!(!h.supervisor.is_tracked(id).await, "delay {}ms", delay_ms);
        assert_eq!(stored_status(&h, id), ProjectStatus::Stopped, "delay {}ms", delay_ms);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_and_stop_keep_one_handle() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("contended", 18090, "sleep 30")).unwrap();
    let spec = command("sleep 30", &h.root_dir());

    let (first, stopped, second) = tokio::join!(
        h.supervisor.start(id, &spec),
        h.supervisor.stop(id),
        h.supervisor.start(id, &spec),
    );
    stopped.unwrap();
    let pids = [first.unwrap(), second.unwrap()];

    // superseded exits are handled by now
    tokio::time::sleep(Duration::from_millis(200)).await;

    let alive: Vec<u32> = pids.iter().copied().filter(|pid| pid_alive(*pid)).collect();
    match h.supervisor.pid(id).await {
        Some(tracked) => {
            assert_eq!(alive, vec![tracked]);
            assert_eq!(stored_status(&h, id), ProjectStatus::Running);
        }
        None => {
            assert!(alive.is_empty(), "untracked survivors: {:?}", alive);
            assert_eq!(stored_status(&h, id), ProjectStatus::Stopped);
        }
    }

    h.supervisor.stop(id).await.unwrap();
    assert!(pids.iter().all(|pid| !pid_alive(*pid)));
}

#[tokio::test]
async fn test_failed_restart_leaves_project_stopped() {
    let h = Harness::new();
    let id = h.db.create_project(&project_input("flaky", 18091, "sleep 30")).unwrap();

    let first = h.supervisor.start(id, &command("sleep 30", &h.root_dir())).await.unwrap();
    let err = h
        .supervisor
        .start(id, &command("/no/such/binary-xyz", &h.root_dir()))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "FILE_NOT_FOUND");
    assert!(!pid_alive(first));
    assert!(!h.supervisor.is_tracked(id).await);
    assert_eq!(stored_status(&h, id), ProjectStatus::Stopped);
}
