//! Daemon tests

mod common;

use common::{test_daemon, write_config, BASE_CONFIG};
use kforward_cli::daemon::{shutdown_on, DaemonCommand};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

#[tokio::test]
async fn test_start_stop_and_status() {
    let t = test_daemon(BASE_CONFIG);

    t.daemon.start_forward("api").await.unwrap();
    assert!(t.daemon.supervisor().is_running("api"));

    let status = t.daemon.status();
    assert_eq!(status.active_project, None);
    assert_eq!(status.forwards.len(), 3);

    let api = &status.forwards[0];
    assert_eq!(api.id, "api");
    assert!(api.running);
    assert_eq!(api.pid, Some(2000));
    assert!(api.uptime_seconds.is_some());
    assert!(!status.forwards[1].running);

    t.daemon.stop_forward("api").await.unwrap();
    assert!(!t.daemon.supervisor().is_running("api"));
    assert_eq!(t.launcher.kills(), 1);
}

#[tokio::test]
async fn test_unknown_forward_is_rejected() {
    let t = test_daemon(BASE_CONFIG);

    let err = t.daemon.start_forward("nope").await.unwrap_err();
    assert!(err.to_string().contains("not found"));

    let err = t.daemon.stop_forward("nope").await.unwrap_err();
    assert!(err.to_string().contains("not found"));

    // Stopping a configured but idle forward is fine
    t.daemon.stop_forward("db").await.unwrap();
    assert_eq!(t.launcher.launches(), 0);
}

#[tokio::test]
async fn test_start_failure_is_reported() {
    let t = test_daemon(BASE_CONFIG);
    t.launcher.fail_port(18080);

    let err = t.daemon.start_forward("api").await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("Failed to start 'api'"));
    assert!(message.contains("18080"));
    assert_eq!(t.daemon.supervisor().reservation_holder(18080), None);
}

#[tokio::test]
async fn test_start_all_collects_errors() {
    let t = test_daemon(BASE_CONFIG);
    t.launcher.fail_port(15432);

    let report = t.daemon.start_all().await;

    assert_eq!(report.started, vec!["api".to_string(), "web".to_string()]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors.contains_key("db"));

    // A second pass only retries what is not running
    let report = t.daemon.start_all().await;
    assert!(report.started.is_empty());
    assert_eq!(t.launcher.launches(), 2);
}

#[tokio::test]
async fn test_reload_port_change_restarts_on_new_port() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("api").await.unwrap();

    write_config(
        &t.config_path,
        &BASE_CONFIG.replace("port_local: 18080", "port_local: 18081"),
    );
    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.stopped, vec!["api".to_string()]);
    assert_eq!(report.updated, vec!["api".to_string()]);
    assert_eq!(report.started, vec!["api".to_string()]);
    assert!(report.errors.is_empty());

    assert_eq!(t.launcher.ports(), vec![18080, 18081]);
    let supervisor = t.daemon.supervisor();
    assert_eq!(supervisor.reservation_holder(18081).as_deref(), Some("api"));
    assert_eq!(supervisor.reservation_holder(18080), None);
}

#[tokio::test]
async fn test_reload_does_not_start_idle_forwards() {
    let mut t = test_daemon(BASE_CONFIG);

    write_config(
        &t.config_path,
        &BASE_CONFIG.replace("port_local: 15432", "port_local: 15433"),
    );
    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.updated, vec!["db".to_string()]);
    assert!(report.stopped.is_empty());
    assert!(report.started.is_empty());
    assert_eq!(t.launcher.launches(), 0);
}

#[tokio::test]
async fn test_reload_removed_forward_is_stopped() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("web").await.unwrap();

    let without_web = BASE_CONFIG
        .split("  - id: web")
        .next()
        .unwrap()
        .to_string()
        + "projects:\n  - name: backend\n    forwards: [api, db]\n";
    write_config(&t.config_path, &without_web);

    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.stopped, vec!["web".to_string()]);
    assert!(report.started.is_empty());
    assert!(!t.daemon.supervisor().is_running("web"));
    assert!(t.daemon.store().get("web").is_none());
}

#[tokio::test]
async fn test_reload_invalid_file_keeps_everything() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("api").await.unwrap();

    write_config(&t.config_path, "port_forwards: [");
    let err = t.daemon.reload().await.unwrap_err();

    assert!(format!("{:#}", err).contains("kept previous config"));
    assert!(t.daemon.supervisor().is_running("api"));
    assert_eq!(t.daemon.store().definitions().len(), 3);
    assert_eq!(t.launcher.kills(), 0);
}

#[tokio::test]
async fn test_reload_starts_added_forward_of_active_project() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon
        .activate_project(Some("backend".to_string()))
        .await
        .unwrap();

    let with_cache = BASE_CONFIG.replace(
        "projects:\n  - name: backend\n    forwards: [api, db]",
        "  - id: cache\n    namespace: data\n    service: redis\n    port_remote: 6379\n    port_local: 16379\nprojects:\n  - name: backend\n    forwards: [api, db, cache]",
    );
    write_config(&t.config_path, &with_cache);

    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.added, vec!["cache".to_string()]);
    assert_eq!(report.started, vec!["cache".to_string()]);
    assert!(t.daemon.supervisor().is_running("cache"));
    assert_eq!(t.daemon.store().active_project(), Some("backend"));
}

#[tokio::test]
async fn test_activate_project_switches_running_set() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("web").await.unwrap();

    let report = t
        .daemon
        .activate_project(Some("backend".to_string()))
        .await
        .unwrap();

    assert_eq!(report.stopped, vec!["web".to_string()]);
    assert_eq!(report.started, vec!["api".to_string(), "db".to_string()]);
    assert_eq!(t.daemon.store().active_project(), Some("backend"));
    assert_eq!(
        t.daemon.supervisor().running_slots(),
        vec!["api".to_string(), "db".to_string()]
    );

    let report = t.daemon.activate_project(None).await.unwrap();
    assert_eq!(report.stopped, vec!["api".to_string(), "db".to_string()]);
    assert!(report.started.is_empty());
    assert_eq!(t.daemon.store().active_project(), None);
    assert_eq!(t.daemon.supervisor().running_count(), 0);
    assert_eq!(t.launcher.kills(), 3);
}

#[tokio::test]
async fn test_activate_keeps_members_running() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("api").await.unwrap();

    let report = t
        .daemon
        .activate_project(Some("backend".to_string()))
        .await
        .unwrap();

    assert!(report.stopped.is_empty());
    assert_eq!(report.started, vec!["db".to_string()]);
    assert_eq!(t.launcher.launches(), 2);
    assert_eq!(t.launcher.kills(), 0);
}

#[tokio::test]
async fn test_activate_unknown_project_changes_nothing() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("web").await.unwrap();

    let err = t
        .daemon
        .activate_project(Some("frontend".to_string()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("not found"));
    assert!(t.daemon.supervisor().is_running("web"));
    assert_eq!(t.daemon.store().active_project(), None);
}

#[tokio::test]
async fn test_restart_all_relaunches_running_forwards() {
    let t = test_daemon(BASE_CONFIG);
    t.daemon.start_forward("api").await.unwrap();
    t.daemon.start_forward("db").await.unwrap();

    let report = t.daemon.restart_all().await.unwrap();

    assert_eq!(report.restarted, 2);
    assert!(report.errors.is_empty());
    assert_eq!(t.launcher.launches(), 4);
    assert_eq!(t.launcher.kills(), 2);
    assert!(!t.daemon.supervisor().is_running("web"));
}

#[tokio::test]
async fn test_run_loop_and_shutdown_cleanup() {
    let t = test_daemon(BASE_CONFIG);
    let launcher = t.launcher.clone();
    let (command_tx, command_rx) = mpsc::channel(32);

    let handle = tokio::spawn(t.daemon.run(command_rx));

    let (reply, rx) = oneshot::channel();
    command_tx
        .send(DaemonCommand::Start("api".to_string(), reply))
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    let (reply, rx) = oneshot::channel();
    command_tx.send(DaemonCommand::Status(reply)).await.unwrap();
    let status = rx.await.unwrap();
    assert!(status.forwards.iter().any(|f| f.id == "api" && f.running));

    command_tx.send(DaemonCommand::Shutdown).await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(launcher.kills(), 1);
}

#[tokio::test]
async fn test_run_loop_stops_when_senders_drop() {
    let t = test_daemon(BASE_CONFIG);
    let launcher = t.launcher.clone();
    let (command_tx, command_rx) = mpsc::channel(32);

    let handle = tokio::spawn(t.daemon.run(command_rx));

    let (reply, rx) = oneshot::channel();
    command_tx
        .send(DaemonCommand::Start("web".to_string(), reply))
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    drop(command_tx);
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(launcher.kills(), 1);
}

#[tokio::test]
async fn test_reload_stops_removed_forward_outside_active_project() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon
        .activate_project(Some("backend".to_string()))
        .await
        .unwrap();
    t.daemon.start_forward("web").await.unwrap();

    let without_web = BASE_CONFIG
        .split("  - id: web")
        .next()
        .unwrap()
        .to_string()
        + "projects:\n  - name: backend\n    forwards: [api, db]\n";
    write_config(&t.config_path, &without_web);

    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.stopped, vec!["web".to_string()]);
    assert!(!t.daemon.supervisor().is_running("web"));
    assert_eq!(t.daemon.supervisor().reservation_holder(13000), None);
    assert!(t.daemon.supervisor().is_running("api"));
    assert!(t.daemon.supervisor().is_running("db"));
}

#[tokio::test]
async fn test_reload_moves_edited_forward_outside_active_project() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon
        .activate_project(Some("backend".to_string()))
        .await
        .unwrap();
    t.daemon.start_forward("web").await.unwrap();

    write_config(
        &t.config_path,
        &BASE_CONFIG.replace("port_local: 13000", "port_local: 13001"),
    );
    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.stopped, vec!["web".to_string()]);
    assert_eq!(report.updated, vec!["web".to_string()]);
    assert_eq!(report.started, vec!["web".to_string()]);

    let supervisor = t.daemon.supervisor();
    assert_eq!(supervisor.reservation_holder(13000), None);
    assert_eq!(supervisor.reservation_holder(13001).as_deref(), Some("web"));
    assert_eq!(t.daemon.store().active_project(), Some("backend"));
}

#[tokio::test]
async fn test_reload_leaves_added_non_member_idle() {
    let mut t = test_daemon(BASE_CONFIG);
    t.daemon
        .activate_project(Some("backend".to_string()))
        .await
        .unwrap();
    let launches = t.launcher.launches();

    let with_cache = BASE_CONFIG.replace(
        "projects:",
        "  - id: cache\n    namespace: data\n    service: redis\n    port_remote: 6379\n    port_local: 16379\nprojects:",
    );
    write_config(&t.config_path, &with_cache);

    let report = t.daemon.reload().await.unwrap();

    assert_eq!(report.added, vec!["cache".to_string()]);
    assert!(report.started.is_empty());
    assert!(!t.daemon.supervisor().is_running("cache"));
    assert_eq!(t.launcher.launches(), launches);
}

#[tokio::test]
async fn test_shutdown_signal_cleans_up() {
    let t = test_daemon(BASE_CONFIG);
    let launcher = t.launcher.clone();
    let (command_tx, command_rx) = mpsc::channel(32);
    let (signal_tx, signal_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(t.daemon.run(command_rx));
    let watcher = shutdown_on(
        async move {
            let _ = signal_rx.await;
        },
        "SIGTERM",
        command_tx.clone(),
    );

    for id in ["api", "db"] {
        let (reply, rx) = oneshot::channel();
        command_tx
            .send(DaemonCommand::Start(id.to_string(), reply))
            .await
            .unwrap();
        rx.await.unwrap().unwrap();
    }
    drop(command_tx);

    signal_tx.send(()).unwrap();
    watcher.await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(launcher.kills(), 2);
}
