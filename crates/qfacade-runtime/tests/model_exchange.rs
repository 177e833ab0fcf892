//! Prompt/response exchanges against a real line-oriented child.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MARKER, NOISY_RUNNER_SCRIPT, RUNNER_SCRIPT, fast_config, runner};
use qfacade_core::{FacadeError, HealthState, TimeoutPhase};
use qfacade_runtime::{CorrelatorConfig, LineChannel, ProcessSupervisor, StreamCorrelator};
use tokio::time::Instant;

fn correlator(sup: &Arc<ProcessSupervisor>, response_timeout: Duration) -> StreamCorrelator {
    let channel: Arc<dyn LineChannel> = sup.clone();
    StreamCorrelator::new(
        channel,
        CorrelatorConfig {
            terminal_marker: MARKER.to_string(),
            newline_escape: "\\n".to_string(),
            strip_echo: true,
            response_timeout,
        },
    )
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

#[tokio::test]
async fn test_answer_is_extracted_without_marker() {
    let sup = runner(RUNNER_SCRIPT, &[MARKER], fast_config());
    let correlator = correlator(&sup, Duration::from_secs(5));
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let exchange = correlator.exchange("what is 2+2", deadline()).await.unwrap();
    assert_eq!(exchange.text, "hello\nthe answer is 4");

    let again = correlator.exchange("ping", deadline()).await.unwrap();
    assert_eq!(again.text, "you said: ping");

    sup.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_output_before_the_prompt_is_never_attributed() {
    let sup = runner(NOISY_RUNNER_SCRIPT, &[MARKER], fast_config());
    let correlator = correlator(&sup, Duration::from_secs(5));
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let exchange = correlator.exchange("hi", deadline()).await.unwrap();
    assert_eq!(exchange.text, "reply to hi");
    assert!(!exchange.text.contains("Welcome"));
    assert!(!exchange.text.contains("stale"));
    assert!(exchange.window.opened_at <= exchange.closed_at);

    sup.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_crash_mid_request_fails_then_recovers() {
    let sup = runner(RUNNER_SCRIPT, &[MARKER], fast_config());
    let correlator = correlator(&sup, Duration::from_secs(5));
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let err = correlator.exchange("crash", deadline()).await.unwrap_err();
    assert!(matches!(err, FacadeError::ProcessCrashed { .. }));

    // base backoff is 50ms
    let mut rx = sup.health_receiver();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|h| h.epoch == 2 && h.is_ready()),
    )
    .await
    .unwrap()
    .unwrap();
    let health = sup.health();
    assert_eq!(health.state, HealthState::Ready);
    assert_eq!(health.restart_count, 1);

    let exchange = correlator.exchange("what is 2+2", deadline()).await.unwrap();
    assert_eq!(exchange.text, "hello\nthe answer is 4");
    assert_eq!(exchange.window.epoch, 2);

    sup.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_wedged_runner_times_out_and_is_restarted() {
    let mut config = fast_config();
    config.restart_on_response_timeout = true;
    let sup = runner(
        "echo 'LLM init ok'; printf 'prompt >> '; read -r line; sleep 600",
        &["LLM init ok"],
        config,
    );
    let correlator = correlator(&sup, Duration::from_millis(300));
    sup.start().await.unwrap();
    sup.wait_ready(Duration::from_secs(5)).await.unwrap();

    let err = correlator.exchange("hello?", deadline()).await.unwrap_err();
    assert_eq!(
        err,
        FacadeError::RequestTimeout {
            phase: TimeoutPhase::Executing,
            after: Duration::from_millis(300),
        }
    );

    let mut rx = sup.health_receiver();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|h| h.epoch == 2 && h.is_ready()),
    )
    .await
    .unwrap()
    .unwrap();

    sup.stop(Duration::from_secs(1)).await.unwrap();
}
