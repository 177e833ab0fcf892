//! Lifecycle of real child processes under the supervisor.

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{CRASHING_SCRIPT, MARKER, RUNNER_SCRIPT, fast_config, runner};
use qfacade_core::{FacadeError, HealthState};
use qfacade_runtime::pidfile::read_pidfile;
use qfacade_runtime::{LaunchSpec, OutputPatternProbe, ProcessLogBuffer, ProcessSupervisor};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_runner_becomes_ready_on_ready_pattern() {
    let sup = runner(RUNNER_SCRIPT, &["LLM init ok"], fast_config());
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let health = sup.health();
    assert_eq!(health.state, HealthState::Ready);
    assert!(health.last_health_check.is_some());
    assert!(
        sup.logs()
            .tail(10)
            .iter()
            .any(|entry| entry.line.contains("loading weights"))
    );

    assert_eq!(sup.health_check().await, HealthState::Ready);
    sup.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(sup.health().state, HealthState::Stopped);
}

#[tokio::test]
async fn test_exit_is_detected_and_restarted() {
    let sup = runner(RUNNER_SCRIPT, &[MARKER], fast_config());
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let mut rx = sup.health_receiver();
    sup.write_line("crash").await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|h| h.epoch == 2 && h.is_ready()),
    )
    .await
    .unwrap()
    .unwrap();

    let health = sup.health();
    assert_eq!(health.restart_count, 1);
    assert!(!health.fatal);
    sup.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_repeated_crashes_become_fatal() {
    let sup = runner(CRASHING_SCRIPT, &[MARKER], fast_config());
    sup.start().await.unwrap();

    let err = sup.wait_ready(Duration::from_secs(10)).await.unwrap_err();
    assert_eq!(
        err,
        FacadeError::RestartExhausted {
            name: "model".to_string(),
            attempts: 3,
        }
    );

    let health = sup.health();
    assert!(health.fatal);
    assert_eq!(health.state, HealthState::Crashed);
    assert_eq!(health.restart_count, 3);

    // No further attempts once fatal.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sup.health().restart_count, 3);
    assert_eq!(sup.health().epoch, 4);

    sup.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_operator_restart_revives_fatal_process() {
    let dir = TempDir::new().unwrap();
    let flag = dir.path().join("healthy");
    // Crashes until the flag file exists.
    let script = format!(
        "if [ -f '{}' ]; then echo 'LLM init ok'; exec cat; else exit 1; fi",
        flag.display()
    );
    let sup = runner(&script, &["LLM init ok"], fast_config());
    sup.start().await.unwrap();
    assert!(matches!(
        sup.wait_ready(Duration::from_secs(10)).await,
        Err(FacadeError::RestartExhausted { .. })
    ));

    std::fs::write(&flag, "").unwrap();
    sup.restart().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();
    assert!(!sup.health().fatal);

    sup.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_pid_file_follows_the_child() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("run").join("model.pid");

    let logs = Arc::new(ProcessLogBuffer::new());
    let probe = OutputPatternProbe::new(Arc::clone(&logs), vec!["up".to_string()]);
    let spec = LaunchSpec::new("model", "sh")
        .with_args(["-c", "echo up; exec cat"])
        .with_pid_file(&pid_path);
    let sup = ProcessSupervisor::new(spec, fast_config(), Arc::new(probe), logs);

    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(Some(read_pidfile(&pid_path).unwrap()), sup.health().pid);

    sup.stop(Duration::from_secs(2)).await.unwrap();
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_stop_escalates_when_quit_is_ignored() {
    let sup = runner(
        "echo 'LLM init ok'; while true; do sleep 1; done",
        &["LLM init ok"],
        fast_config(),
    );
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let started = tokio::time::Instant::now();
    sup.stop(Duration::from_millis(200)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(sup.health().state, HealthState::Stopped);
}

#[tokio::test]
async fn test_startup_timeout_counts_as_crash() {
    let mut config = fast_config();
    config.startup_timeout = Duration::from_millis(200);
    config.restart_policy.max_consecutive_restarts = 1;
    let sup = runner("exec cat", &["never printed"], config);
    sup.start().await.unwrap();

    let err = sup.wait_ready(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, FacadeError::RestartExhausted { attempts: 1, .. }));
    assert!(sup.health().last_error.is_some());
    sup.stop(Duration::from_secs(1)).await.unwrap();
}
