//! End-to-end supervisor behaviour against shell-script stand-ins for
//! `cloudflared`.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cloudflared_tunnel_core::platform::{PortProbe, PortReaper};
use cloudflared_tunnel_core::provision::FixedExecutable;
use cloudflared_tunnel_core::{
    StartError, StatusChange, SupervisorSettings, TunnelSpec, TunnelStatus, TunnelSupervisor,
};
use tempfile::TempDir;

const BANNER: &str = "2024-01-15T10:00:00Z INF Start Websocket listener host=localhost:8123";

/// A fake `cloudflared` in its own temp dir. Every invocation appends its
/// arguments, `|`-separated, as one line of `calls.log`. The script sees its
/// directory as `$FAKE_DIR`.
struct FakeTunnel {
    dir: TempDir,
    binary: PathBuf,
}

impl FakeTunnel {
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("cloudflared");
        let log = dir.path().join("calls.log");
        let script = format!(
            "#!/bin/sh\nFAKE_DIR='{dir}'\nprintf '%s|' \"$@\" >> '{log}'\necho >> '{log}'\n{body}\n",
            dir = dir.path().display(),
            log = log.display()
        );
        fs::write(&binary, script).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, binary }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        let Ok(log) = fs::read_to_string(self.dir.path().join("calls.log")) else {
            return Vec::new();
        };
        log.lines()
            .map(|line| {
                line.trim_end_matches('|')
                    .split('|')
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    }

    fn path(&self) -> &Path {
        &self.binary
    }
}

#[derive(Default)]
struct FakePorts {
    active: AtomicBool,
    cleared: Mutex<Vec<u16>>,
}

#[async_trait]
impl PortProbe for FakePorts {
    async fn is_port_active(&self, _port: u16) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortReaper for FakePorts {
    async fn clear_port(&self, port: u16) -> usize {
        self.cleared.lock().unwrap().push(port);
        1
    }
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        // Reconciliation is driven by hand.
        reconcile_interval: Duration::from_secs(3600),
        restart_cooldown: Duration::from_secs(300),
        stop_grace: Duration::from_secs(1),
        startup_probe: Duration::from_secs(3),
        spawn_attempts: 3,
        spawn_retry_delay: Duration::from_millis(50),
        clear_port_on_stop: true,
    }
}

fn supervise(fake: &FakeTunnel, token: Option<&str>) -> (TunnelSupervisor, Arc<FakePorts>) {
    supervise_with(fake, token, settings())
}

fn supervise_with(
    fake: &FakeTunnel,
    token: Option<&str>,
    settings: SupervisorSettings,
) -> (TunnelSupervisor, Arc<FakePorts>) {
    let spec = TunnelSpec::new("demo.example.com", 8123, token.map(str::to_string)).unwrap();
    let ports = Arc::new(FakePorts::default());
    let supervisor =
        TunnelSupervisor::builder(spec, Arc::new(FixedExecutable::new(fake.path())))
            .settings(settings)
            .port_probe(ports.clone())
            .port_reaper(ports.clone())
            .build();
    (supervisor, ports)
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn healthy_body() -> String {
    format!("echo '{BANNER}' >&2\nexec sleep 30")
}

#[tokio::test]
async fn healthy_start_reports_running_with_expected_args() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, None);

    supervisor.start().await.unwrap();

    assert_eq!(supervisor.status_string(), "running");
    assert!(supervisor.pid().await.is_some());
    assert!(supervisor.is_process_alive().await);
    assert_eq!(
        fake.calls(),
        vec![vec![
            "access",
            "tcp",
            "--hostname",
            "demo.example.com",
            "--url",
            "localhost:8123"
        ]]
    );

    supervisor.stop().await;
}

#[tokio::test]
async fn token_is_passed_as_service_token_id() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, Some("svc-123"));

    supervisor.start().await.unwrap();
    let calls = fake.calls();
    assert_eq!(&calls[0][6..], ["--service-token-id", "svc-123"]);

    supervisor.stop().await;
}

#[tokio::test]
async fn error_on_first_line_fails_start() {
    let fake = FakeTunnel::new("echo '2024-01-15T10:00:00Z ERR failed to connect' >&2\nexec sleep 30");
    let (supervisor, _) = supervise(&fake, None);

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, StartError::Rejected { .. }), "{err:?}");
    assert_eq!(supervisor.status_string(), "error: failed to connect");
    assert_eq!(supervisor.last_error().as_deref(), Some("failed to connect"));
    assert_eq!(supervisor.pid().await, None);
}

#[tokio::test]
async fn silent_exit_during_startup_fails_start() {
    let fake = FakeTunnel::new("exit 3");
    let (supervisor, _) = supervise(&fake, None);

    let err = supervisor.start().await.unwrap_err();
    match err {
        StartError::ExitedEarly { status } => assert!(status.contains("code 3"), "{status}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(supervisor.status().kind(), cloudflared_tunnel_core::status::StatusKind::Error);
}

#[tokio::test]
async fn missing_binary_is_a_provisioning_error() {
    let spec = TunnelSpec::new("demo.example.com", 8123, None).unwrap();
    let supervisor = TunnelSupervisor::builder(
        spec,
        Arc::new(FixedExecutable::new("/nonexistent/cloudflared")),
    )
    .settings(SupervisorSettings {
        clear_port_on_stop: false,
        ..settings()
    })
    .build();

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, StartError::Provisioning(_)), "{err:?}");
    assert!(supervisor.status_string().starts_with("error: "));
    assert_eq!(supervisor.spawn_count(), 0);
}

#[tokio::test]
async fn start_is_idempotent_while_alive() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, None);

    supervisor.start().await.unwrap();
    let pid = supervisor.pid().await;
    supervisor.start().await.unwrap();

    assert_eq!(supervisor.pid().await, pid);
    assert_eq!(supervisor.spawn_count(), 1);
    assert_eq!(fake.calls().len(), 1);

    supervisor.stop().await;
}

#[tokio::test]
async fn stop_without_start_is_harmless() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, None);

    supervisor.stop().await;
    supervisor.stop().await;

    assert_eq!(supervisor.status(), TunnelStatus::Stopped);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn stop_clears_a_port_still_in_use() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, ports) = supervise(&fake, None);

    supervisor.start().await.unwrap();
    ports.active.store(true, Ordering::SeqCst);
    supervisor.stop().await;

    assert_eq!(supervisor.status(), TunnelStatus::Stopped);
    assert_eq!(supervisor.pid().await, None);
    assert_eq!(*ports.cleared.lock().unwrap(), vec![8123]);
}

#[tokio::test]
async fn stop_kills_a_process_that_ignores_sigterm() {
    let fake = FakeTunnel::new(&format!(
        "trap '' TERM\necho '{BANNER}' >&2\nwhile true; do sleep 1; done"
    ));
    let (supervisor, ports) = supervise(&fake, None);

    supervisor.start().await.unwrap();
    let started = Instant::now();
    supervisor.stop().await;

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(supervisor.status(), TunnelStatus::Stopped);
    assert!(ports.cleared.lock().unwrap().is_empty());
}

#[tokio::test]
async fn crash_is_restarted_once_per_cooldown() {
    let fake = FakeTunnel::new(&format!("echo '{BANNER}' >&2\nsleep 0.3\nexit 1"));
    let (supervisor, _) = supervise(&fake, None);

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.last_restart_description(), "never");

    wait_for("crash to be observed", || {
        supervisor.status() == TunnelStatus::error("process terminated unexpectedly")
    })
    .await;

    supervisor.reconcile().await;
    assert_eq!(supervisor.spawn_count(), 2);
    assert!(supervisor.last_restart().is_some());

    // The replacement crashes too; the cooldown now holds it back.
    wait_for("second crash", || !supervisor.status().is_running()).await;
    supervisor.reconcile().await;

    assert_eq!(supervisor.spawn_count(), 2);
    assert_eq!(
        supervisor.status_string(),
        "error: process terminated unexpectedly"
    );
    assert_eq!(supervisor.pid().await, None);
}

#[tokio::test]
async fn authentication_failure_is_not_restarted() {
    let fake = FakeTunnel::new(
        "echo '2024-01-15T10:00:00Z ERR failed to authenticate: invalid service token' >&2\nexec sleep 30",
    );
    let (supervisor, _) = supervise(&fake, Some("bad-token"));

    let err = supervisor.start().await.unwrap_err();
    assert!(err.is_authentication(), "{err:?}");
    assert!(
        supervisor
            .status_string()
            .starts_with("error: token authentication failed"),
        "{}",
        supervisor.status_string()
    );

    supervisor.reconcile().await;
    supervisor.reconcile().await;
    assert_eq!(supervisor.spawn_count(), 1);
}

#[tokio::test]
async fn runtime_error_line_sets_error_until_reconciled() {
    let fake = FakeTunnel::new(&format!(
        "echo '{BANNER}' >&2\nsleep 0.2\necho '2024-01-15T10:00:01Z ERR dial tcp: connection refused' >&2\nexec sleep 30"
    ));
    let (supervisor, _) = supervise(&fake, None);

    supervisor.start().await.unwrap();
    wait_for("error line", || {
        supervisor.last_error().as_deref() == Some("dial tcp: connection refused")
    })
    .await;
    assert!(supervisor.is_process_alive().await);

    supervisor.reconcile().await;
    assert_eq!(supervisor.status(), TunnelStatus::Running);
    assert_eq!(supervisor.spawn_count(), 1);

    supervisor.stop().await;
}

#[tokio::test]
async fn unsubscribed_listener_receives_nothing_further() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, None);

    let seen: Arc<Mutex<Vec<(TunnelStatus, TunnelStatus)>>> = Arc::default();
    let sink = seen.clone();
    let id = supervisor.subscribe_status(Arc::new(move |change: &StatusChange| {
        sink.lock()
            .unwrap()
            .push((change.previous.clone(), change.current.clone()));
    }));

    supervisor.start().await.unwrap();
    wait_for("running notification", || !seen.lock().unwrap().is_empty()).await;
    assert_eq!(
        seen.lock().unwrap()[0],
        (TunnelStatus::Stopped, TunnelStatus::Running)
    );

    supervisor.unsubscribe_status(id);
    supervisor.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn shutdown_stops_the_tunnel() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, None);

    supervisor.start().await.unwrap();
    supervisor.shutdown().await;

    assert_eq!(supervisor.status(), TunnelStatus::Stopped);
    assert!(!supervisor.is_process_alive().await);
}

#[tokio::test]
async fn token_rejection_stays_reported_after_the_process_exits() {
    let fake = FakeTunnel::new(&format!(
        "echo '{BANNER}' >&2\nsleep 0.2\necho '2024-01-15T10:00:01Z ERR failed to authenticate: invalid service token' >&2\nsleep 0.3\nexit 1"
    ));
    let (supervisor, _) = supervise(&fake, Some("bad-token"));

    supervisor.start().await.unwrap();
    wait_for("token rejection", || {
        supervisor
            .status_string()
            .starts_with("error: token authentication failed")
    })
    .await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.is_process_alive().await {
        assert!(Instant::now() < deadline, "tunnel process never exited");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    supervisor.reconcile().await;
    assert_eq!(
        supervisor.last_error().as_deref(),
        Some("token authentication failed: failed to authenticate: invalid service token")
    );
    assert_eq!(supervisor.pid().await, None);
    assert_eq!(supervisor.spawn_count(), 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn busy_binary_is_retried_until_released() {
    let fake = FakeTunnel::new(&healthy_body());
    // An open write handle makes exec fail with ETXTBSY.
    let writer = fs::OpenOptions::new().write(true).open(fake.path()).unwrap();
    let (supervisor, _) = supervise_with(
        &fake,
        None,
        SupervisorSettings {
            spawn_retry_delay: Duration::from_millis(300),
            ..settings()
        },
    );

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(writer);
    });
    supervisor.start().await.unwrap();
    release.await.unwrap();

    assert_eq!(supervisor.status(), TunnelStatus::Running);
    assert_eq!(supervisor.spawn_count(), 1);
    assert_eq!(fake.calls().len(), 1);

    supervisor.stop().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn busy_binary_gives_up_after_all_attempts() {
    let fake = FakeTunnel::new(&healthy_body());
    let _writer = fs::OpenOptions::new().write(true).open(fake.path()).unwrap();
    let (supervisor, _) = supervise(&fake, None);

    let err = supervisor.start().await.unwrap_err();
    match &err {
        StartError::Spawn { attempts, source } => {
            assert_eq!(*attempts, 3);
            assert!(source.is_transient(), "{source:?}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(supervisor.status_string().starts_with("error: "));
    assert_eq!(supervisor.spawn_count(), 0);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn periodic_reconciliation_restarts_a_crash_until_stopped() {
    let fake = FakeTunnel::new(&format!(
        "if [ -e \"$FAKE_DIR/crashed\" ]; then\n  echo '{BANNER}' >&2\n  exec sleep 30\nfi\ntouch \"$FAKE_DIR/crashed\"\necho '{BANNER}' >&2\nsleep 0.3\nexit 1"
    ));
    let (supervisor, _) = supervise_with(
        &fake,
        None,
        SupervisorSettings {
            reconcile_interval: Duration::from_millis(200),
            ..settings()
        },
    );

    supervisor.start().await.unwrap();
    wait_for("automatic restart", || {
        supervisor.spawn_count() == 2 && supervisor.status().is_running()
    })
    .await;
    assert!(supervisor.last_restart().is_some());

    supervisor.stop().await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(supervisor.status(), TunnelStatus::Stopped);
    assert_eq!(supervisor.spawn_count(), 2);
    assert_eq!(fake.calls().len(), 2);
}

#[tokio::test]
async fn racing_start_and_stop_keep_one_consistent_process() {
    let fake = FakeTunnel::new(&healthy_body());
    let (supervisor, _) = supervise(&fake, None);

    let (started, ()) = tokio::join!(supervisor.start(), supervisor.stop());
    started.unwrap();
    assert!(!supervisor.is_starting());
    assert!(supervisor.spawn_count() <= 1);

    let was_running = match supervisor.status() {
        TunnelStatus::Running => {
            assert!(supervisor.pid().await.is_some());
            assert!(supervisor.is_process_alive().await);
            true
        }
        TunnelStatus::Stopped => {
            assert_eq!(supervisor.pid().await, None);
            assert!(!supervisor.is_process_alive().await);
            false
        }
        other => panic!("unexpected status: {other}"),
    };

    let before = supervisor.spawn_count();
    let (first, second) = tokio::join!(supervisor.start(), supervisor.start());
    first.unwrap();
    second.unwrap();

    let expected = if was_running { before } else { before + 1 };
    assert_eq!(supervisor.spawn_count(), expected);
    assert_eq!(supervisor.status(), TunnelStatus::Running);
    assert!(supervisor.pid().await.is_some());
    assert_eq!(fake.calls().len() as u64, expected);

    supervisor.stop().await;
    assert_eq!(supervisor.pid().await, None);
}

#[tokio::test]
async fn is_starting_while_waiting_for_first_output() {
    let fake = FakeTunnel::new(&format!("sleep 0.5\necho '{BANNER}' >&2\nexec sleep 30"));
    let (supervisor, _) = supervise(&fake, None);

    let starter = supervisor.clone();
    let launch = tokio::spawn(async move { starter.start().await });

    wait_for("launch in flight", || supervisor.is_starting()).await;
    assert_eq!(supervisor.status(), TunnelStatus::Stopped);

    launch.await.unwrap().unwrap();
    assert!(!supervisor.is_starting());
    assert_eq!(supervisor.status(), TunnelStatus::Running);

    supervisor.stop().await;
}
