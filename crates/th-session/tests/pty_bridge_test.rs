use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use th_session::pty_bridge::{pump_output, ManagedProcess, SpawnError};
use th_session::{AdmissionController, OutputWriter, SessionConfig};

fn write_app(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write app");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod app");
}

fn config(dir: &Path, names: &[&str]) -> SessionConfig {
    SessionConfig {
        apps_directory: dir.to_path_buf(),
        allowed_apps: names
            .iter()
            .map(|n| (n.to_string(), String::new()))
            .collect::<BTreeMap<_, _>>(),
        allowed_origins: vec![],
    }
}

fn no_announce(_: &str) {}

#[test]
fn test_launch_passes_args_and_terminal_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_app(
        dir.path(),
        "envdump",
        r#"echo "args=$*"
echo "TERM=$TERM COLORTERM=$COLORTERM PROGRAM=${TERM_PROGRAM:-unset}""#,
    );
    let config = config(dir.path(), &["envdump"]);
    let admission = Arc::new(AdmissionController::new(1));

    let mut announced = None;
    let launched = ManagedProcess::launch(
        &config,
        &admission,
        "envdump",
        &["black".to_string(), "lotus".to_string()],
        |name| announced = Some(name.to_string()),
    )
    .expect("launch");
    assert_eq!(announced.as_deref(), Some("envdump"));
    assert_eq!(admission.current_jobs(), 1);
    assert!(launched.process.pid().is_some());

    let (out, rx) = OutputWriter::channel();
    let id = launched.process.id();
    let pump = std::thread::spawn(move || pump_output(id, launched.reader, out, || false));
    pump.join().expect("pump thread");

    let text: String = rx.try_iter().map(|m| m.output).collect();
    assert!(text.contains("args=black lotus"), "got {text:?}");
    assert!(
        text.contains("TERM=xterm-256color COLORTERM=truecolor PROGRAM=unset"),
        "got {text:?}"
    );

    launched.process.finish();
    assert_eq!(admission.current_jobs(), 0);
}

#[test]
fn test_launch_failure_releases_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Present but not executable.
    std::fs::write(dir.path().join("broken"), "not a program").expect("write");
    let config = config(dir.path(), &["broken"]);
    let admission = Arc::new(AdmissionController::new(1));

    let err = ManagedProcess::launch(&config, &admission, "broken", &[], no_announce)
        .err()
        .expect("launch should fail");
    assert!(matches!(err, SpawnError::LaunchFailed { .. }), "{err:?}");
    assert!(err.user_message().starts_with("Error starting app: "));
    assert_eq!(admission.current_jobs(), 0);
}

#[test]
fn test_terminate_kills_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_app(dir.path(), "sleeper", "sleep 30");
    let config = config(dir.path(), &["sleeper"]);
    let admission = Arc::new(AdmissionController::new(1));

    let launched =
        ManagedProcess::launch(&config, &admission, "sleeper", &[], no_announce).expect("launch");
    let mut child = launched.child;
    launched.process.terminate();
    assert_eq!(admission.current_jobs(), 0);

    let (tx, rx) = flume::bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(child.wait().map(|s| s.success()));
    });
    let status = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("child should exit after terminate")
        .expect("wait");
    assert!(!status);
}

#[test]
fn test_resize_reports_change() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_app(dir.path(), "sleeper", "sleep 30");
    let config = config(dir.path(), &["sleeper"]);
    let admission = Arc::new(AdmissionController::new(1));

    let launched =
        ManagedProcess::launch(&config, &admission, "sleeper", &[], no_announce).expect("launch");
    let process = launched.process;
    assert_eq!(process.size().expect("size"), (24, 80));

    assert!(!process.resize(24, 80).expect("resize"));
    assert!(process.resize(40, 120).expect("resize"));
    assert_eq!(process.size().expect("size"), (40, 120));

    process.terminate();
}

#[test]
fn test_admission_cap_under_contention() {
    let admission = Arc::new(AdmissionController::new(3));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let admission = Arc::clone(&admission);
            std::thread::spawn(move || admission.acquire_slot())
        })
        .collect();
    let slots: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().expect("thread"))
        .collect();

    assert_eq!(slots.len(), 3);
    assert_eq!(admission.current_jobs(), 3);
    drop(slots);
    assert_eq!(admission.current_jobs(), 0);
}
